use crate::protocol::{ProtocolError, Reply, ReplyDecoder, Request, ABORT_LINE};
use crate::session::CancelHandle;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

/// Poll interval for socket reads; waits check deadlines and cancellation
/// at least this often.
const READ_POLL: Duration = Duration::from_millis(10);

/// How long to drain the reply of an aborted request before giving up on it.
const ABORT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Automation service refused the connection at {addr}; is it running?")]
    ConnectionRefused { addr: String },

    #[error("Could not resolve automation service address {addr}")]
    AddressResolution { addr: String },

    #[error("Connection to automation service was closed")]
    ConnectionLost,

    #[error("Timed out after {after:?} waiting for reply to {command} (received so far: '{received}')")]
    Timeout {
        command: &'static str,
        after: Duration,
        received: String,
    },

    #[error("Request {command} was cancelled")]
    Cancelled { command: &'static str },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TerminalError {
    /// Whether the socket can no longer be trusted for further requests.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TerminalError::Protocol(ProtocolError::InvalidField { .. }))
    }
}

/// Socket connection to the automation service with no request in flight.
#[derive(Debug)]
pub struct IdleAutomationTerminal {
    stream: TcpStream,
    addr: String,
    decoder: ReplyDecoder,
}

impl IdleAutomationTerminal {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, TerminalError> {
        log::debug!("Connecting to automation service at {}", addr);

        let resolved: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(|_| TerminalError::AddressResolution {
                addr: addr.to_string(),
            })?
            .collect();
        if resolved.is_empty() {
            return Err(TerminalError::AddressResolution {
                addr: addr.to_string(),
            });
        }

        let mut last_error = None;
        for candidate in &resolved {
            match TcpStream::connect_timeout(candidate, timeout) {
                Ok(stream) => return Self::from_stream(stream, addr.to_string()),
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) if e.kind() == ErrorKind::ConnectionRefused => {
                Err(TerminalError::ConnectionRefused {
                    addr: addr.to_string(),
                })
            }
            Some(e) => Err(e.into()),
            None => Err(TerminalError::ConnectionLost),
        }
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, addr: String) -> Result<Self, TerminalError> {
        stream.set_read_timeout(Some(READ_POLL))?;
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        log::info!("Connected to automation service at {}", addr);

        Ok(Self {
            stream,
            addr,
            decoder: ReplyDecoder::new(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Execute a request and wait for its reply.
    pub fn exec(&mut self, request: &Request, timeout: Duration) -> Result<Reply, TerminalError> {
        self.send(request)?;
        let start = Instant::now();
        loop {
            if let Some(reply) = self.poll()? {
                return Ok(reply);
            }
            if start.elapsed() >= timeout {
                return Err(TerminalError::Timeout {
                    command: request.command(),
                    after: timeout,
                    received: self.decoder.pending_text(),
                });
            }
        }
    }

    /// Send a request whose reply may take long to arrive.
    pub fn exec_async(mut self, request: &Request) -> Result<BusyAutomationTerminal, (Self, TerminalError)> {
        if let Err(e) = self.send(request) {
            return Err((self, e));
        }
        Ok(BusyAutomationTerminal {
            inner: self,
            command: request.command(),
            start: Instant::now(),
        })
    }

    fn send(&mut self, request: &Request) -> Result<(), TerminalError> {
        let line = request.encode()?;
        log::trace!("-> {}", line.trim_end());
        self.decoder.reset();
        self.stream.write_all(line.as_bytes())?;
        Ok(())
    }

    /// One bounded read; returns a reply once complete.
    fn poll(&mut self) -> Result<Option<Reply>, TerminalError> {
        let mut buf = [0u8; 1024];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(TerminalError::ConnectionLost),
            Ok(n) => {
                let reply = self.decoder.feed(&buf[..n])?;
                if let Some(reply) = &reply {
                    log::trace!("<- {:?}", reply);
                }
                Ok(reply)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::BrokenPipe) => {
                Err(TerminalError::ConnectionLost)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Terminal with a request in flight.
#[derive(Debug)]
pub struct BusyAutomationTerminal {
    inner: IdleAutomationTerminal,
    command: &'static str,
    start: Instant,
}

impl BusyAutomationTerminal {
    /// Wait for the reply until `timeout` has passed since the request was
    /// sent or `cancel` fires. In both of those cases the pending request is
    /// aborted and the terminal is handed back, if it is still usable.
    pub fn wait_timeout(
        self,
        timeout: Duration,
        cancel: &CancelHandle,
    ) -> (Result<Reply, TerminalError>, Option<IdleAutomationTerminal>) {
        let mut busy = self;
        loop {
            match busy.inner.poll() {
                Ok(Some(reply)) => return (Ok(reply), Some(busy.inner)),
                Ok(None) => {}
                Err(e) => return (Err(e), None),
            }

            if cancel.is_cancelled() {
                log::debug!("{} cancelled by caller, aborting", busy.command);
                let command = busy.command;
                return (Err(TerminalError::Cancelled { command }), busy.abort());
            }

            if busy.start.elapsed() >= timeout {
                log::warn!("{} did not complete within {:?}, aborting", busy.command, timeout);
                let error = TerminalError::Timeout {
                    command: busy.command,
                    after: timeout,
                    received: busy.inner.decoder.pending_text(),
                };
                return (Err(error), busy.abort());
            }
        }
    }

    /// Ask the service to end the pending request and drain its reply.
    /// Returns `None` when the connection should be dropped instead.
    pub fn abort(mut self) -> Option<IdleAutomationTerminal> {
        if let Err(e) = self.inner.stream.write_all(ABORT_LINE) {
            log::warn!("Failed to send abort for {}: {}", self.command, e);
            return None;
        }

        let start = Instant::now();
        while start.elapsed() < ABORT_DRAIN {
            match self.inner.poll() {
                Ok(Some(_)) => return Some(self.inner),
                Ok(None) => {}
                Err(_) => return None,
            }
        }
        log::warn!("No reply to abort of {}; dropping connection", self.command);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteCode;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::thread;

    /// Accepts one connection and answers each received line from `script`.
    fn scripted_server(script: Vec<(&'static str, &'static str)>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut received = Vec::new();
            for (expected_prefix, reply) in script {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap() == 0 {
                    break;
                }
                assert!(line.starts_with(expected_prefix), "unexpected request {line:?}");
                received.push(line.trim_end().to_string());
                writer.write_all(reply.as_bytes()).unwrap();
            }
            // Hold the connection open until the client hangs up.
            let mut rest = String::new();
            while reader.read_line(&mut rest).unwrap_or(0) > 0 {
                rest.clear();
            }
            received
        });
        (addr, handle)
    }

    #[test]
    fn test_exec_reads_payload_and_ack() {
        let (addr, server) = scripted_server(vec![("GET_DEVICES", "d1\tLOGIC_8\t1\nACK\n")]);
        let mut terminal = IdleAutomationTerminal::connect(&addr, Duration::from_secs(1)).unwrap();

        let reply = terminal
            .exec(&Request::new("GET_DEVICES"), Duration::from_secs(2))
            .unwrap();
        assert_eq!(
            reply,
            Reply::Ack {
                payload: vec!["d1\tLOGIC_8\t1".into()]
            }
        );
        drop(terminal);
        assert_eq!(server.join().unwrap(), vec!["GET_DEVICES"]);
    }

    #[test]
    fn test_exec_times_out() {
        let (addr, _server) = scripted_server(vec![("WAIT_CAPTURE", "")]);
        let mut terminal = IdleAutomationTerminal::connect(&addr, Duration::from_secs(1)).unwrap();

        let err = terminal
            .exec(&Request::new("WAIT_CAPTURE").arg("1"), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, TerminalError::Timeout { command: "WAIT_CAPTURE", .. }));
    }

    #[test]
    fn test_wait_timeout_aborts_pending_request() {
        let (addr, server) = scripted_server(vec![
            ("WAIT_CAPTURE", ""),
            ("ABORT", "NAK\tABORTED\twait aborted\n"),
            ("STOP_CAPTURE", "ACK\n"),
        ]);
        let terminal = IdleAutomationTerminal::connect(&addr, Duration::from_secs(1)).unwrap();

        let busy = terminal
            .exec_async(&Request::new("WAIT_CAPTURE").arg("5"))
            .unwrap();
        let (result, idle) = busy.wait_timeout(Duration::from_millis(50), &CancelHandle::new());
        assert!(matches!(result, Err(TerminalError::Timeout { .. })));

        let mut idle = idle.expect("terminal usable after abort");
        let reply = idle
            .exec(&Request::new("STOP_CAPTURE").arg("5"), Duration::from_secs(2))
            .unwrap();
        assert!(reply.is_ack());
        drop(idle);
        assert_eq!(
            server.join().unwrap(),
            vec!["WAIT_CAPTURE\t5", "ABORT", "STOP_CAPTURE\t5"]
        );
    }

    #[test]
    fn test_wait_honours_cancel() {
        let (addr, _server) = scripted_server(vec![
            ("WAIT_TRIGGER", ""),
            ("ABORT", "NAK\tABORTED\tcancelled\n"),
        ]);
        let terminal = IdleAutomationTerminal::connect(&addr, Duration::from_secs(1)).unwrap();
        let cancel = CancelHandle::new();
        cancel.cancel();

        let busy = terminal.exec_async(&Request::new("WAIT_TRIGGER").arg("1")).unwrap();
        let (result, idle) = busy.wait_timeout(Duration::from_secs(10), &cancel);
        assert!(matches!(result, Err(TerminalError::Cancelled { .. })));
        assert!(idle.is_some());
    }

    #[test]
    fn test_nak_is_a_reply_not_an_error() {
        let (addr, _server) = scripted_server(vec![("ADD_ANALYZER", "NAK\tUNKNOWN_ANALYZER\tnope\n")]);
        let mut terminal = IdleAutomationTerminal::connect(&addr, Duration::from_secs(1)).unwrap();
        let reply = terminal
            .exec(&Request::new("ADD_ANALYZER").arg("1"), Duration::from_secs(2))
            .unwrap();
        assert!(matches!(reply, Reply::Nak { code: RemoteCode::UnknownAnalyzer, .. }));
    }

    #[test]
    fn test_connection_refused_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = IdleAutomationTerminal::connect(&addr, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, TerminalError::ConnectionRefused { .. }));
    }
}
