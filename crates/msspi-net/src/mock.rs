//! Scripted engine and transport for tests.
//!
//! [`MockEngine`] speaks a line-based toy handshake through the real bridge
//! callbacks, so every byte it moves goes registry -> conduit -> transport
//! exactly as a native engine's would.
//!
//! Handshake: the client sends `HELLO\n` (or `HELLO CERT\n` with an identity
//! installed) and expects `WELCOME\n`. A server requiring peer auth answers a
//! certificate-less hello with `DENIED\n` and fails. Application data is
//! passed through unchanged; [`CLOSE_NOTIFY`] marks a graceful shutdown.

use std::collections::VecDeque;
use std::ffi::{CStr, c_int};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use msspi_types::backend::NetworkStream;
use msspi_types::error::{MsspiError, Result};
use msspi_types::tls::{CipherInfo, sp_prot};

use crate::engine::{BridgeLink, Engine, EngineProvider, EngineState, Step};

pub const CLOSE_NOTIFY: &[u8] = b"\x15close_notify";
pub const MOCK_SUITE: u32 = 0xC02F;

/// What the test engine saw, shared with the test body.
#[derive(Debug, Default)]
pub struct Record {
    /// Hostname bytes including the trailing NUL.
    pub hostname: Option<Vec<u8>>,
    pub client: bool,
    pub peer_auth: bool,
    pub certificates: Vec<Vec<u8>>,
    pub opens: u32,
    pub closes: u32,
    pub shutdowns: u32,
    pub verifies: u32,
}

#[derive(Clone, Default)]
struct Behaviour {
    fail_open: bool,
    reject_certificates: bool,
    write_chunk: Option<usize>,
    peer_certs: Vec<Vec<u8>>,
    chain_verified: bool,
}

pub struct MockProvider {
    behaviour: Behaviour,
    journal: Arc<Mutex<Record>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            behaviour: Behaviour::default(),
            journal: Arc::new(Mutex::new(Record::default())),
        }
    }

    pub fn failing_open(mut self) -> Self {
        self.behaviour.fail_open = true;
        self
    }

    pub fn rejecting_certificates(mut self) -> Self {
        self.behaviour.reject_certificates = true;
        self
    }

    /// Accept at most `chunk` plaintext bytes per engine write.
    pub fn with_write_chunk(mut self, chunk: usize) -> Self {
        self.behaviour.write_chunk = Some(chunk);
        self
    }

    pub fn with_peer_certs(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.behaviour.peer_certs = certs;
        self
    }

    pub fn with_verified_chain(mut self) -> Self {
        self.behaviour.chain_verified = true;
        self
    }

    pub fn journal(&self) -> Arc<Mutex<Record>> {
        Arc::clone(&self.journal)
    }
}

impl EngineProvider for MockProvider {
    type Engine = MockEngine;

    fn open(&self, link: BridgeLink) -> Option<MockEngine> {
        self.journal.lock().unwrap().opens += 1;
        if self.behaviour.fail_open {
            return None;
        }
        Some(MockEngine {
            link,
            behaviour: self.behaviour.clone(),
            journal: Arc::clone(&self.journal),
            client: false,
            has_cert: false,
            peer_auth: false,
            phase: Phase::Start,
            pending: Vec::new(),
            inbox: Vec::new(),
            sent_shutdown: false,
            received_shutdown: false,
            error: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Start,
    Sending,
    AwaitReply,
    Established,
}

pub struct MockEngine {
    link: BridgeLink,
    behaviour: Behaviour,
    journal: Arc<Mutex<Record>>,
    client: bool,
    has_cert: bool,
    peer_auth: bool,
    phase: Phase,
    /// Handshake bytes not yet accepted by the transport.
    pending: Vec<u8>,
    /// Bytes read from the transport and not yet consumed.
    inbox: Vec<u8>,
    sent_shutdown: bool,
    received_shutdown: bool,
    error: bool,
}

impl MockEngine {
    fn fail(&mut self) -> Step {
        self.error = true;
        Step::Failed
    }

    /// Push `pending` out. `Some(step)` means the caller must return it.
    fn flush(&mut self) -> Option<Step> {
        while !self.pending.is_empty() {
            let n = self.link.write(&self.pending);
            if n < 0 {
                return Some(Step::InProgress);
            }
            if n == 0 {
                return Some(self.fail());
            }
            self.pending.drain(..n as usize);
        }
        None
    }

    /// Read until a full line is buffered. `Err(step)` means return it.
    fn read_line(&mut self) -> std::result::Result<Vec<u8>, Step> {
        loop {
            if let Some(pos) = self.inbox.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.inbox.drain(..=pos).collect();
                return Ok(line[..pos].to_vec());
            }
            let mut buf = [0u8; 64];
            let n = self.link.read(&mut buf);
            if n < 0 {
                return Err(Step::InProgress);
            }
            if n == 0 {
                return Err(self.fail());
            }
            self.inbox.extend_from_slice(&buf[..n as usize]);
        }
    }

    fn step(&mut self) -> Step {
        if self.error {
            return Step::Failed;
        }
        loop {
            match self.phase {
                Phase::Established => return Step::Done,
                Phase::Start if self.client => {
                    let hello: &[u8] = if self.has_cert {
                        b"HELLO CERT\n"
                    } else {
                        b"HELLO\n"
                    };
                    self.pending = hello.to_vec();
                    self.phase = Phase::Sending;
                },
                Phase::Start => {
                    let line = match self.read_line() {
                        Ok(line) => line,
                        Err(step) => return step,
                    };
                    if !line.starts_with(b"HELLO") {
                        return self.fail();
                    }
                    if self.peer_auth && line != b"HELLO CERT" {
                        self.pending = b"DENIED\n".to_vec();
                        let _ = self.flush();
                        return self.fail();
                    }
                    self.pending = b"WELCOME\n".to_vec();
                    self.phase = Phase::Sending;
                },
                Phase::Sending => {
                    if let Some(step) = self.flush() {
                        return step;
                    }
                    self.phase = if self.client {
                        Phase::AwaitReply
                    } else {
                        Phase::Established
                    };
                },
                Phase::AwaitReply => {
                    let line = match self.read_line() {
                        Ok(line) => line,
                        Err(step) => return step,
                    };
                    if line != b"WELCOME" {
                        return self.fail();
                    }
                    self.phase = Phase::Established;
                },
            }
        }
    }

    fn established(&self) -> bool {
        self.phase == Phase::Established
    }

    fn fill<'a>(
        certs: &'a [Vec<u8>],
        out: Option<&mut [&'a [u8]]>,
        count: &mut usize,
    ) -> bool {
        if certs.is_empty() {
            return false;
        }
        match out {
            None => *count = certs.len(),
            Some(slots) => {
                let n = slots.len().min(certs.len());
                for (slot, cert) in slots.iter_mut().zip(certs) {
                    *slot = cert.as_slice();
                }
                *count = n;
            },
        }
        true
    }
}

impl Engine for MockEngine {
    fn set_client(&mut self) {
        self.client = true;
        self.journal.lock().unwrap().client = true;
    }

    fn set_hostname(&mut self, name: &CStr) -> bool {
        self.journal.lock().unwrap().hostname = Some(name.to_bytes_with_nul().to_vec());
        true
    }

    fn add_certificate(&mut self, der: &[u8]) -> bool {
        if self.behaviour.reject_certificates {
            return false;
        }
        self.has_cert = true;
        self.journal.lock().unwrap().certificates.push(der.to_vec());
        true
    }

    fn set_peer_auth(&mut self, required: bool) -> bool {
        self.peer_auth = required;
        self.journal.lock().unwrap().peer_auth = required;
        true
    }

    fn connect(&mut self) -> Step {
        self.step()
    }

    fn accept(&mut self) -> Step {
        self.step()
    }

    fn read(&mut self, buf: &mut [u8]) -> c_int {
        if !self.established() || self.received_shutdown {
            return 0;
        }
        if !self.inbox.is_empty() {
            let n = buf.len().min(self.inbox.len());
            buf[..n].copy_from_slice(&self.inbox[..n]);
            self.inbox.drain(..n);
            return n as c_int;
        }
        let n = self.link.read(buf);
        if n > 0 && buf.starts_with(CLOSE_NOTIFY) {
            self.received_shutdown = true;
            return 0;
        }
        n
    }

    fn write(&mut self, data: &[u8]) -> c_int {
        if !self.established() || self.sent_shutdown {
            return 0;
        }
        let chunk = self.behaviour.write_chunk.unwrap_or(data.len());
        self.link.write(&data[..chunk.min(data.len())])
    }

    fn shutdown(&mut self) {
        self.journal.lock().unwrap().shutdowns += 1;
        if self.established() && !self.sent_shutdown && !self.error {
            self.sent_shutdown = self.link.write(CLOSE_NOTIFY) > 0;
        }
    }

    fn state(&self) -> EngineState {
        let mut bits = 0;
        if self.error {
            bits |= EngineState::ERROR;
        }
        if self.sent_shutdown {
            bits |= EngineState::SENT_SHUTDOWN;
        }
        if self.received_shutdown {
            bits |= EngineState::RECEIVED_SHUTDOWN;
        }
        EngineState(bits)
    }

    fn cipher_info(&self) -> CipherInfo {
        if !self.established() {
            return CipherInfo::default();
        }
        CipherInfo {
            protocol: if self.client {
                sp_prot::TLS1_2_CLIENT
            } else {
                sp_prot::TLS1_2_SERVER
            },
            cipher_suite: MOCK_SUITE,
        }
    }

    fn peer_certificates<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool {
        Self::fill(&self.behaviour.peer_certs, out, count)
    }

    fn verify(&mut self) -> bool {
        self.journal.lock().unwrap().verifies += 1;
        self.established() && self.behaviour.chain_verified
    }

    fn peer_chain<'a>(&'a self, out: Option<&mut [&'a [u8]]>, count: &mut usize) -> bool {
        Self::fill(&self.behaviour.peer_certs, out, count)
    }

    fn close(&mut self) {
        self.journal.lock().unwrap().closes += 1;
    }
}

/// One scripted transport read.
#[derive(Debug)]
pub enum Inbound {
    Data(Vec<u8>),
    /// `Ok(0)`: nothing available.
    Idle,
    Timeout,
    Eof,
    UnexpectedEof,
    Fail(io::ErrorKind),
}

/// One scripted transport write.
#[derive(Debug)]
pub enum Outbound {
    /// Take the bytes (subject to the write limit and budget).
    Accept,
    /// `Ok(0)`: nothing taken.
    Idle,
    Timeout,
    UnexpectedEof,
}

/// Transport that replays a read script and records writes.
///
/// An exhausted read script reads as end of stream. Writes follow the write
/// script while it lasts and are accepted afterwards.
pub struct ScriptedStream {
    inbound: VecDeque<Inbound>,
    writes: VecDeque<Outbound>,
    outbound: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    write_limit: Option<usize>,
    write_budget: Option<usize>,
    close_error: Option<io::ErrorKind>,
}

impl ScriptedStream {
    pub fn new() -> Self {
        Self {
            inbound: VecDeque::new(),
            writes: VecDeque::new(),
            outbound: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            write_limit: None,
            write_budget: None,
            close_error: None,
        }
    }

    pub fn with(mut self, item: Inbound) -> Self {
        self.inbound.push_back(item);
        self
    }

    pub fn with_data(self, data: &[u8]) -> Self {
        self.with(Inbound::Data(data.to_vec()))
    }

    pub fn with_write(mut self, item: Outbound) -> Self {
        self.writes.push_back(item);
        self
    }

    /// Accept at most `limit` bytes per write call.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Accept `budget` bytes in total, then fail with a broken pipe.
    pub fn with_write_budget(mut self, budget: usize) -> Self {
        self.write_budget = Some(budget);
        self
    }

    pub fn with_close_error(mut self, kind: io::ErrorKind) -> Self {
        self.close_error = Some(kind);
        self
    }

    pub fn outbound(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.outbound)
    }

    pub fn closed(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

impl NetworkStream for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.inbound.pop_front() {
            None | Some(Inbound::Eof) => Err(MsspiError::Eof),
            Some(Inbound::Idle) => Ok(0),
            Some(Inbound::Timeout) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            Some(Inbound::UnexpectedEof) => {
                Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
            },
            Some(Inbound::Fail(kind)) => Err(io::Error::from(kind).into()),
            Some(Inbound::Data(mut data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    self.inbound.push_front(Inbound::Data(data));
                }
                Ok(n)
            },
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MsspiError::Closed);
        }
        match self.writes.pop_front() {
            Some(Outbound::Idle) => return Ok(0),
            Some(Outbound::Timeout) => {
                return Err(io::Error::from(io::ErrorKind::TimedOut).into());
            },
            Some(Outbound::UnexpectedEof) => {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            },
            Some(Outbound::Accept) | None => {},
        }
        let mut n = data.len().min(self.write_limit.unwrap_or(usize::MAX));
        if let Some(budget) = self.write_budget.as_mut() {
            if *budget == 0 {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
            }
            n = n.min(*budget);
            *budget -= n;
        }
        self.outbound.lock().unwrap().extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        match self.close_error {
            Some(kind) => Err(io::Error::from(kind).into()),
            None => Ok(()),
        }
    }
}
