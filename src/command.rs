//! Opcode / settling delay / CRC-checked response protocol.
//!
//! Chips like humidity and CO₂ sensors do not expose flat registers.  Instead the host writes a
//! 16-bit big-endian opcode (optionally followed by argument words), waits for the chip to finish
//! the requested work, and then reads back a number of 16-bit words.  Each word travels as two
//! data bytes followed by a CRC-8 over those two bytes:
//!
//! ```text
//! | opcode MSB | opcode LSB | (arg MSB | arg LSB | CRC)* |
//! | word MSB | word LSB | CRC | word MSB | word LSB | CRC | ...
//! ```
//!
//! A single invocation runs through `Idle → OpcodeSent → Settling → ResponseRead` and ends in
//! one of the [`Outcome`]s.  Nothing but the last decoded value and the time of the last transfer
//! survives between invocations.
use crate::{AddressableDevice, Error, Result};
use core::time::Duration;
use std::time::Instant;

pub const CRC8_POLYNOMIAL: u8 = 0x31;
pub const CRC8_INIT: u8 = 0xff;

/// Most words a single command can send or receive.
pub const MAX_WORDS: usize = 16;

/// Decoded response words.
pub type Words = heapless::Vec<u16, MAX_WORDS>;

/// CRC-8 with polynomial `0x31` and initial value `0xff`, no reflection, no final XOR.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRC8_INIT;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// A word as it appears on the wire: big-endian data bytes followed by their CRC.
pub fn encode_word(word: u16) -> [u8; 3] {
    let [msb, lsb] = word.to_be_bytes();
    [msb, lsb, crc8(&[msb, lsb])]
}

/// Validate and strip the CRC of every 3-byte block.
pub fn decode_words(bytes: &[u8]) -> Result<Words> {
    if bytes.len() % 3 != 0 || bytes.len() / 3 > MAX_WORDS {
        return Err(Error::InvalidResponse("response is not a whole number of words"));
    }
    let mut words = Words::new();
    for (word, block) in bytes.chunks_exact(3).enumerate() {
        let expected = crc8(&block[..2]);
        if expected != block[2] {
            return Err(Error::Crc {
                word,
                expected,
                actual: block[2],
            });
        }
        // cannot overflow, length checked above
        let _ = words.push(u16::from_be_bytes([block[0], block[1]]));
    }
    Ok(words)
}

/// Decoding of validated response words into a typed value.
pub trait Response: Sized + Clone {
    fn decode(words: &[u16]) -> Result<Self>;
}

impl Response for () {
    fn decode(_words: &[u16]) -> Result<Self> {
        Ok(())
    }
}

impl Response for u16 {
    fn decode(words: &[u16]) -> Result<Self> {
        words
            .first()
            .copied()
            .ok_or(Error::InvalidResponse("empty response"))
    }
}

impl Response for Words {
    fn decode(words: &[u16]) -> Result<Self> {
        Ok(words.iter().copied().collect())
    }
}

/// How the last physical invocation of a [`Command`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Validated,
    /// The transfer worked but the response was unusable: a CRC mismatch, or words that
    /// [`Response::decode`] rejected.  Any error with [`Error::is_validation`] lands here.
    CrcFailed,
    IoFailed,
}

/// One command of a command-based chip, with its cached last result.
#[derive(Debug, Clone)]
pub struct Command<T = ()> {
    opcode: u16,
    settle: Duration,
    response_words: usize,
    min_interval: Option<Duration>,
    not_valid_before: Option<Instant>,
    last_executed: Option<Instant>,
    outcome: Option<Outcome>,
    cached: Option<T>,
}

impl<T: Response> Command<T> {
    pub const fn new(opcode: u16) -> Self {
        Self {
            opcode,
            settle: Duration::ZERO,
            response_words: 0,
            min_interval: None,
            not_valid_before: None,
            last_executed: None,
            outcome: None,
            cached: None,
        }
    }

    /// Time the chip needs between receiving the opcode and having the response ready.
    pub const fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Number of CRC-protected words the chip answers with.
    pub const fn response_words(mut self, words: usize) -> Self {
        assert!(words <= MAX_WORDS);
        self.response_words = words;
        self
    }

    /// Serve the cached result instead of talking to the chip for `interval` after each
    /// successful invocation.
    pub const fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = Some(interval);
        self
    }

    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    pub fn settle_time(&self) -> Duration {
        self.settle
    }

    /// Expected response length in bytes, CRCs included.
    pub fn response_len(&self) -> usize {
        self.response_words * 3
    }

    pub fn last_outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn last_executed(&self) -> Option<Instant> {
        self.last_executed
    }

    /// Last successfully decoded result.
    pub fn cached(&self) -> Option<&T> {
        self.cached.as_ref()
    }

    /// Allow the next invocation to hit the bus even if the minimum interval has not passed.
    pub fn expire(&mut self) {
        self.not_valid_before = None;
    }

    /// Drop the cached result, e.g. after the chip was reset.
    pub fn clear(&mut self) {
        self.cached = None;
        self.not_valid_before = None;
    }

    /// Run the command, or return the cached result while rate limited.
    ///
    /// Blocks for the settling delay.  On a CRC mismatch or a response that fails to decode the
    /// cached result is left untouched and [`Outcome::CrcFailed`] is recorded.
    pub fn execute<D: AddressableDevice>(&mut self, dev: &mut D, args: &[u16]) -> Result<T> {
        let now = Instant::now();
        if let (Some(deadline), Some(cached)) = (self.not_valid_before, &self.cached) {
            if now < deadline {
                tracing::trace!(address = %dev.address(), opcode = self.opcode, "rate limited");
                return Ok(cached.clone());
            }
        }

        self.last_executed = Some(now);
        let result = self.transfer(dev, args).and_then(|words| T::decode(&words));
        self.outcome = Some(match &result {
            Ok(_) => Outcome::Validated,
            Err(e) if e.is_validation() => Outcome::CrcFailed,
            Err(_) => Outcome::IoFailed,
        });
        let value = result.map_err(|e| {
            tracing::debug!(
                address = %dev.address(),
                opcode = self.opcode,
                error = %e,
                "command failed"
            );
            e
        })?;

        self.cached = Some(value.clone());
        self.not_valid_before = self.min_interval.map(|interval| now + interval);
        Ok(value)
    }

    fn transfer<D: AddressableDevice>(&mut self, dev: &mut D, args: &[u16]) -> Result<Words> {
        if args.len() > MAX_WORDS {
            return Err(Error::Unsupported("too many command arguments"));
        }
        let frame: heapless::Vec<u8, { 2 + 3 * MAX_WORDS }> = self
            .opcode
            .to_be_bytes()
            .into_iter()
            .chain(args.iter().flat_map(|w| encode_word(*w)))
            .collect();
        dev.write(&frame)?;

        dev.settle(self.settle);

        if self.response_words == 0 {
            return Ok(Words::new());
        }
        let mut buf = [0u8; 3 * MAX_WORDS];
        let buf = &mut buf[..self.response_len()];
        dev.read(buf)?;
        decode_words(buf)
    }
}

impl Command<()> {
    /// Run a command that has no response.
    pub fn send<D: AddressableDevice>(&mut self, dev: &mut D) -> Result<()> {
        self.execute(dev, &[])
    }
}
