//! Scripted in-memory sockets for driving relay connections in tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;

/// Scripted read results.
#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    Data(Vec<u8>),
    Eof,
    Fail,
}

/// Scripted write results.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Outbound {
    Accept(usize),
    Block,
    Fail,
}

#[derive(Debug, Default)]
struct Script {
    inbound: VecDeque<Inbound>,
    outbound: VecDeque<Outbound>,
    written: Vec<u8>,
}

/// In-memory socket. Reads return `WouldBlock` when the script runs
/// dry; writes accept everything when no limit is scripted.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockStream(Rc<RefCell<Script>>);

impl MockStream {
    pub(crate) fn push_data(&self, bytes: &[u8]) {
        self.0
            .borrow_mut()
            .inbound
            .push_back(Inbound::Data(bytes.to_vec()));
    }

    pub(crate) fn push(&self, inbound: Inbound) {
        self.0.borrow_mut().inbound.push_back(inbound);
    }

    pub(crate) fn limit(&self, outbound: Outbound) {
        self.0.borrow_mut().outbound.push_back(outbound);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.0.borrow().written.clone()
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut script = self.0.borrow_mut();
        match script.inbound.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Inbound::Eof) => {
                script.inbound.push_front(Inbound::Eof);
                Ok(0)
            }
            Some(Inbound::Fail) => Err(io::ErrorKind::ConnectionReset.into()),
            Some(Inbound::Data(mut bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    script.inbound.push_front(Inbound::Data(bytes.split_off(n)));
                }
                Ok(n)
            }
        }
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut script = self.0.borrow_mut();
        let n = match script.outbound.pop_front() {
            None => buf.len(),
            Some(Outbound::Accept(limit)) => limit.min(buf.len()),
            Some(Outbound::Block) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(Outbound::Fail) => return Err(io::ErrorKind::BrokenPipe.into()),
        };
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        script.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
