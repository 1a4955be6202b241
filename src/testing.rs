//! Simulated bus with behavioural chip models, for tests where a scripted transaction list does
//! not fit: concurrent callers, address scans, and repeated read-back.
use crate::command::encode_word;
use core::time::Duration;
use embedded_hal::i2c::{self, ErrorKind, NoAcknowledgeSource, Operation};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub(crate) trait FakeChip: Send {
    fn write(&mut self, bytes: &[u8]);
    fn read(&mut self, buf: &mut [u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Write(u8),
    Read(u8),
}

#[derive(Default)]
struct State {
    chips: BTreeMap<u8, Box<dyn FakeChip>>,
    failing: Vec<u8>,
    log: Vec<Op>,
    transfer_delay: Duration,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBus {
    state: Arc<Mutex<State>>,
}

impl FakeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chip(address: u8, chip: impl FakeChip + 'static) -> Self {
        let bus = Self::new();
        bus.attach(address, chip);
        bus
    }

    pub fn attach(&self, address: u8, chip: impl FakeChip + 'static) {
        self.state.lock().unwrap().chips.insert(address, Box::new(chip));
    }

    /// Make every transfer to `address` fail with a bus error (or stop doing so).
    pub fn set_failing(&self, address: u8, failing: bool) {
        let mut state = self.state.lock().unwrap();
        state.failing.retain(|a| *a != address);
        if failing {
            state.failing.push(address);
        }
    }

    /// Sleep after each transfer so that unserialized callers get a chance to interleave.
    pub fn set_transfer_delay(&self, delay: Duration) {
        self.state.lock().unwrap().transfer_delay = delay;
    }

    pub fn log(&self) -> Vec<Op> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn transfers_to(&self, address: u8) -> usize {
        self.log()
            .iter()
            .filter(|op| matches!(op, Op::Write(a) | Op::Read(a) if *a == address))
            .count()
    }
}

impl i2c::ErrorType for FakeBus {
    type Error = ErrorKind;
}

impl i2c::I2c for FakeBus {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), ErrorKind> {
        let delay = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            if state.failing.contains(&address) {
                return Err(ErrorKind::Bus);
            }
            let chip = state
                .chips
                .get_mut(&address)
                .ok_or(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))?;
            for op in operations.iter_mut() {
                match op {
                    Operation::Write(bytes) => {
                        chip.write(bytes);
                        state.log.push(Op::Write(address));
                    }
                    Operation::Read(buf) => {
                        chip.read(buf);
                        state.log.push(Op::Read(address));
                    }
                }
            }
            state.transfer_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

/// Chip with 256 byte-wide registers and an auto-incrementing register pointer.
pub(crate) struct RegisterChip {
    regs: [u8; 256],
    pointer: u8,
}

impl RegisterChip {
    pub fn with_registers(values: &[(u8, u8)]) -> Self {
        let mut regs = [0u8; 256];
        for (offset, value) in values {
            regs[usize::from(*offset)] = *value;
        }
        Self { regs, pointer: 0 }
    }
}

impl FakeChip for RegisterChip {
    fn write(&mut self, bytes: &[u8]) {
        if let Some((pointer, data)) = bytes.split_first() {
            self.pointer = *pointer;
            for b in data {
                self.regs[usize::from(self.pointer)] = *b;
                self.pointer = self.pointer.wrapping_add(1);
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.regs[usize::from(self.pointer)];
            self.pointer = self.pointer.wrapping_add(1);
        }
    }
}

/// Chip speaking the 16-bit opcode / CRC-protected word protocol.
#[derive(Default)]
pub(crate) struct CommandChip {
    responses: BTreeMap<u16, Vec<u16>>,
    pending: Vec<u8>,
}

impl CommandChip {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, opcode: u16, words: &[u16]) -> Self {
        self.responses.insert(opcode, words.to_vec());
        self
    }
}

impl FakeChip for CommandChip {
    fn write(&mut self, bytes: &[u8]) {
        self.pending.clear();
        if let [hi, lo, ..] = bytes {
            let opcode = u16::from_be_bytes([*hi, *lo]);
            if let Some(words) = self.responses.get(&opcode) {
                self.pending = words.iter().flat_map(|w| encode_word(*w)).collect();
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.pending.get(i).copied().unwrap_or(0xff);
        }
        self.pending.clear();
    }
}
