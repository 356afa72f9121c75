//! HTTP(S) engine, with byte-range resume.

use super::{ChunkSink, DownloadEngine, EngineError, ErrorClass, Interrupt, PackageInfo, Transfer};
use reqwest::header;
use std::io::Read;
use std::{thread, time};

/// Granularity at which a retry backoff polls for interruptions.
const BACKOFF_SLICE: time::Duration = time::Duration::from_millis(100);

#[derive(Clone, Debug)]
pub(crate) struct HttpSettings {
    pub(crate) timeout: time::Duration,
    /// Retries on communication errors, per `download` call.
    pub(crate) retries: u32,
    pub(crate) chunk_size: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: time::Duration::from_secs(30),
            retries: 3,
            chunk_size: 16 * 1024,
        }
    }
}

#[derive(Debug)]
pub(crate) struct HttpEngine {
    settings: HttpSettings,
    client: Option<reqwest::Client>,
    uri: Option<reqwest::Url>,
}

impl HttpEngine {
    pub(crate) fn new(settings: HttpSettings) -> Self {
        Self {
            settings,
            client: None,
            uri: None,
        }
    }

    fn endpoint(&self) -> Result<(&reqwest::Client, &reqwest::Url), EngineError> {
        match (self.client.as_ref(), self.uri.as_ref()) {
            (Some(c), Some(u)) => Ok((c, u)),
            _ => Err(EngineError::Communication(
                "http engine not initialized".to_string(),
            )),
        }
    }

    /// One GET from `offset` to the end; `delivered` tracks accepted bytes.
    fn transfer_from(
        &self,
        offset: u64,
        sink: &mut dyn ChunkSink,
        delivered: &mut u64,
    ) -> Result<Transfer, EngineError> {
        let (client, uri) = self.endpoint()?;
        trace!("GET {} from offset {}", uri, offset);

        let mut req = client.get(uri.clone());
        if offset > 0 {
            req = req.header(header::RANGE, format!("bytes={}-", offset));
        }
        let mut resp = req.send().map_err(communication)?;
        if offset > 0 && resp.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            debug!("nothing left to fetch past byte {}", offset);
            return Ok(Transfer::Complete);
        }
        check_status(resp.status())?;

        // Servers ignoring the range send the whole body again.
        let mut skip = if offset > 0 && resp.status() != reqwest::StatusCode::PARTIAL_CONTENT {
            debug!("range request ignored by server, skipping {} bytes", offset);
            offset
        } else {
            0
        };

        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];
        loop {
            let len = resp
                .read(&mut buf)
                .map_err(|e| EngineError::Communication(e.to_string()))?;
            if len == 0 {
                return Ok(Transfer::Complete);
            }

            let mut chunk = &buf[..len];
            if skip > 0 {
                let skipped = skip.min(len as u64) as usize;
                skip -= skipped as u64;
                chunk = &chunk[skipped..];
                if chunk.is_empty() {
                    continue;
                }
            }

            let accepted = sink.push(chunk)?;
            if accepted == 0 {
                let reason = sink.interrupted().unwrap_or(Interrupt::Abort);
                return Ok(Transfer::Interrupted(reason));
            }
            *delivered += accepted as u64;
        }
    }
}

impl DownloadEngine for HttpEngine {
    fn init(&mut self, uri: &reqwest::Url) -> Result<(), EngineError> {
        let client = reqwest::Client::builder()
            .timeout(self.settings.timeout)
            .build()
            .map_err(communication)?;
        self.client = Some(client);
        self.uri = Some(uri.clone());
        Ok(())
    }

    fn get_info(&mut self) -> Result<PackageInfo, EngineError> {
        let (client, uri) = self.endpoint()?;
        let resp = client.head(uri.clone()).send().map_err(communication)?;
        check_status(resp.status())?;

        let size = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        debug!("package at {}: size {:?}", uri, size);
        Ok(PackageInfo { size })
    }

    fn download(
        &mut self,
        start_offset: u64,
        sink: &mut dyn ChunkSink,
    ) -> Result<Transfer, EngineError> {
        let mut delivered = 0u64;
        let mut attempt = 0u32;
        loop {
            if let Some(reason) = sink.interrupted() {
                return Ok(Transfer::Interrupted(reason));
            }

            let err = match self.transfer_from(start_offset + delivered, sink, &mut delivered) {
                Ok(transfer) => return Ok(transfer),
                Err(e) => e,
            };
            if err.class() != ErrorClass::Communication || attempt >= self.settings.retries {
                return Err(err);
            }

            attempt += 1;
            warn!(
                "transfer failed at byte {} ({}), retry {}/{}",
                start_offset + delivered,
                err,
                attempt,
                self.settings.retries
            );
            let backoff = time::Duration::from_secs(u64::from(attempt));
            if let Some(reason) = sleep_unless_interrupted(sink, backoff) {
                return Ok(Transfer::Interrupted(reason));
            }
        }
    }

    fn end_download(&mut self) {
        self.client = None;
    }
}

fn communication(err: reqwest::Error) -> EngineError {
    EngineError::Communication(err.to_string())
}

fn check_status(status: reqwest::StatusCode) -> Result<(), EngineError> {
    if status.is_success() {
        Ok(())
    } else {
        error!("package server replied {}", status);
        Err(EngineError::HttpStatus(status.as_u16()))
    }
}

fn sleep_unless_interrupted(sink: &dyn ChunkSink, total: time::Duration) -> Option<Interrupt> {
    let deadline = time::Instant::now() + total;
    loop {
        if let Some(reason) = sink.interrupted() {
            return Some(reason);
        }
        let now = time::Instant::now();
        if now >= deadline {
            return None;
        }
        thread::sleep(BACKOFF_SLICE.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    const BODY: &[u8] = b"0123456789";

    fn reply(status: &str, length: usize, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            status, length
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Serve one canned reply per connection, recording request heads.
    fn serve(replies: Vec<Vec<u8>>) -> (reqwest::Url, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(vec![]));
        let seen = requests.clone();
        thread::spawn(move || {
            for reply in replies {
                let (mut stream, _) = listener.accept().unwrap();
                let mut head = vec![];
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read(&mut byte).unwrap() == 0 {
                        break;
                    }
                    head.push(byte[0]);
                }
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&head).to_lowercase());
                stream.write_all(&reply).unwrap();
            }
        });
        let uri = reqwest::Url::parse(&format!("http://{}/package.bin", addr)).unwrap();
        (uri, requests)
    }

    fn engine(uri: &reqwest::Url) -> HttpEngine {
        let mut engine = HttpEngine::new(HttpSettings {
            timeout: time::Duration::from_secs(5),
            retries: 1,
            chunk_size: 4,
        });
        engine.init(uri).unwrap();
        engine
    }

    #[derive(Default)]
    struct Collect(Vec<u8>);

    impl ChunkSink for Collect {
        fn push(&mut self, chunk: &[u8]) -> Result<usize, EngineError> {
            self.0.extend_from_slice(chunk);
            Ok(chunk.len())
        }
        fn interrupted(&self) -> Option<Interrupt> {
            None
        }
    }

    struct Interrupted(Interrupt);

    impl ChunkSink for Interrupted {
        fn push(&mut self, _chunk: &[u8]) -> Result<usize, EngineError> {
            Ok(0)
        }
        fn interrupted(&self) -> Option<Interrupt> {
            Some(self.0)
        }
    }

    #[test]
    fn uninitialized_engine_reports_communication_error() {
        let mut engine = HttpEngine::new(HttpSettings::default());
        match engine.get_info() {
            Err(e) => assert_eq!(e.class(), ErrorClass::Communication),
            Ok(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn pending_suspend_skips_the_network() {
        let mut engine = HttpEngine::new(HttpSettings::default());
        let uri = reqwest::Url::parse("http://127.0.0.1:9/never").unwrap();
        engine.init(&uri).unwrap();
        let mut sink = Interrupted(Interrupt::Suspend);
        let transfer = engine.download(10, &mut sink).unwrap();
        assert_eq!(transfer, Transfer::Interrupted(Interrupt::Suspend));
    }

    #[test]
    fn non_success_status_is_an_error() {
        assert!(check_status(reqwest::StatusCode::PARTIAL_CONTENT).is_ok());
        match check_status(reqwest::StatusCode::NOT_FOUND) {
            Err(EngineError::HttpStatus(404)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn head_announces_size() {
        let (uri, requests) = serve(vec![reply("200 OK", BODY.len(), b"")]);
        let info = engine(&uri).get_info().unwrap();
        assert_eq!(info.size, Some(10));
        assert!(requests.lock().unwrap()[0].starts_with("head "));
    }

    #[test]
    fn resume_asks_for_a_range() {
        let (uri, requests) = serve(vec![reply("206 Partial Content", 6, &BODY[4..])]);
        let mut sink = Collect::default();
        let transfer = engine(&uri).download(4, &mut sink).unwrap();
        assert_eq!(transfer, Transfer::Complete);
        assert_eq!(sink.0, &BODY[4..]);
        assert!(requests.lock().unwrap()[0].contains("range: bytes=4-"));
    }

    #[test]
    fn ignored_range_skips_stored_prefix() {
        let (uri, _) = serve(vec![reply("200 OK", BODY.len(), BODY)]);
        let mut sink = Collect::default();
        let transfer = engine(&uri).download(6, &mut sink).unwrap();
        assert_eq!(transfer, Transfer::Complete);
        assert_eq!(sink.0, &BODY[6..]);
    }

    #[test]
    fn dropped_connection_retries_past_delivered_bytes() {
        let (uri, requests) = serve(vec![
            reply("200 OK", BODY.len(), &BODY[..6]),
            reply("206 Partial Content", 4, &BODY[6..]),
        ]);
        let mut sink = Collect::default();
        let transfer = engine(&uri).download(0, &mut sink).unwrap();
        assert_eq!(transfer, Transfer::Complete);
        assert_eq!(sink.0, BODY);
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].contains("range:"));
        assert!(requests[1].contains("range: bytes=6-"));
    }

    #[test]
    fn unsatisfiable_range_means_nothing_left() {
        let (uri, _) = serve(vec![reply("416 Range Not Satisfiable", 0, b"")]);
        let mut sink = Collect::default();
        let transfer = engine(&uri).download(10, &mut sink).unwrap();
        assert_eq!(transfer, Transfer::Complete);
        assert!(sink.0.is_empty());
    }

    #[test]
    fn unsatisfiable_range_from_start_is_an_error() {
        let (uri, _) = serve(vec![reply("416 Range Not Satisfiable", 0, b"")]);
        let mut sink = Collect::default();
        match engine(&uri).download(0, &mut sink) {
            Err(EngineError::HttpStatus(416)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
