//! Cached, typed view of memory-mapped chip registers.
//!
//! A [`Register`] remembers the last raw value it moved over the bus.  That value is only
//! trusted once it is _fresh_, i.e. after a successful [`Register::reload`] or write.  Every
//! partial update goes through read-modify-write so bits outside the changed [`Field`] survive:
//!
//! ```text
//! new = (old & !field.mask()) | (value << field.shift())
//! ```
//!
//! The bit math and byte assembly are plain functions and do not need a bus.
use crate::{AddressableDevice, Error, Result};
use core::marker::PhantomData;

/// How the bytes of a multi-byte register map onto the register's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// The byte at the lowest address is the most significant one.
    BigEndian,
    /// The byte at the lowest address is the least significant one.
    LittleEndian,
}

/// What the hardware allows (and does) on access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadWrite,
    ReadOnly,
    /// Reading has side effects, e.g. clearing latched interrupt flags.  [`Register::reload`] is
    /// destructive on such registers; callers needing repeatable inspection must keep the
    /// decoded value themselves.
    ReadClears,
    /// The chip clears some bits on its own after they were written.  The cache is re-read
    /// before every read-modify-write.
    SelfClearing,
    /// Cannot be read back.  The cache is a shadow seeded with the reset value.
    WriteOnly,
}

/// A contiguous bit range inside a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    shift: u8,
    width: u8,
}

impl Field {
    pub const fn new(shift: u8, width: u8) -> Self {
        assert!(width > 0 && shift as u32 + width as u32 <= 32);
        Self { shift, width }
    }

    pub const fn bit(n: u8) -> Self {
        Self::new(n, 1)
    }

    pub const fn shift(&self) -> u8 {
        self.shift
    }

    pub const fn width(&self) -> u8 {
        self.width
    }

    /// Largest value the field can hold.
    pub const fn max(&self) -> u32 {
        ((1u64 << self.width) - 1) as u32
    }

    pub const fn mask(&self) -> u32 {
        self.max() << self.shift
    }

    pub const fn extract(&self, raw: u32) -> u32 {
        (raw & self.mask()) >> self.shift
    }

    /// Replace the field in `raw` with `value`, leaving all other bits alone.
    pub fn insert(&self, raw: u32, value: u32) -> Result<u32> {
        if value > self.max() {
            return Err(Error::OutOfRange {
                value,
                bits: self.width.into(),
            });
        }
        Ok((raw & !self.mask()) | (value << self.shift))
    }
}

/// Assemble up to four register bytes into a value.
pub fn assemble(bytes: &[u8], order: ByteOrder) -> u32 {
    debug_assert!(bytes.len() <= 4);
    let fold = |acc: u32, b: &u8| (acc << 8) | u32::from(*b);
    match order {
        ByteOrder::BigEndian => bytes.iter().fold(0, fold),
        ByteOrder::LittleEndian => bytes.iter().rev().fold(0, fold),
    }
}

/// Split the low `width` bytes of `raw` in wire order.
pub fn split(raw: u32, width: u8, order: ByteOrder) -> heapless::Vec<u8, 4> {
    let le = raw.to_le_bytes();
    let mut bytes: heapless::Vec<u8, 4> = le[..usize::from(width)].iter().copied().collect();
    if order == ByteOrder::BigEndian {
        bytes.reverse();
    }
    bytes
}

/// Typed interpretation of a raw register value.
pub trait RegisterData: Sized {
    /// Bits this type models.  Bits outside the mask are carried over unchanged by
    /// [`Register::modify`].
    const MASK: u32 = u32::MAX;

    fn decode(raw: u32) -> Self;

    fn encode(&self) -> u32;
}

impl RegisterData for u8 {
    fn decode(raw: u32) -> Self {
        raw as u8
    }

    fn encode(&self) -> u32 {
        (*self).into()
    }
}

impl RegisterData for u16 {
    fn decode(raw: u32) -> Self {
        raw as u16
    }

    fn encode(&self) -> u32 {
        (*self).into()
    }
}

impl RegisterData for u32 {
    fn decode(raw: u32) -> Self {
        raw
    }

    fn encode(&self) -> u32 {
        *self
    }
}

/// One (possibly multi-byte) register with a cached raw value.
#[derive(Debug, Clone)]
pub struct Register<T = u32> {
    offset: u8,
    width: u8,
    order: ByteOrder,
    access: Access,
    raw: u32,
    fresh: bool,
    _t: PhantomData<T>,
}

impl<T: RegisterData> Register<T> {
    /// A read-write register of `width` bytes (1 to 4) starting at `offset`.
    pub const fn new(offset: u8, width: u8, order: ByteOrder) -> Self {
        assert!(width >= 1 && width <= 4);
        Self {
            offset,
            width,
            order,
            access: Access::ReadWrite,
            raw: 0,
            fresh: false,
            _t: PhantomData,
        }
    }

    /// Single-byte read-write register.
    pub const fn byte(offset: u8) -> Self {
        Self::new(offset, 1, ByteOrder::BigEndian)
    }

    pub const fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Seed the shadow of a [`Access::WriteOnly`] register with its power-on value.
    pub const fn with_reset_value(mut self, raw: u32) -> Self {
        self.raw = raw;
        self.fresh = true;
        self
    }

    pub fn offset(&self) -> u8 {
        self.offset
    }

    pub fn width(&self) -> u8 {
        self.width
    }

    pub fn access(&self) -> Access {
        self.access
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Raw cached value, if it can be trusted.
    pub fn raw(&self) -> Option<u32> {
        self.fresh.then_some(self.raw)
    }

    /// Forget the cached value, e.g. after the chip was reset.
    pub fn invalidate(&mut self) {
        if self.access != Access::WriteOnly {
            self.fresh = false;
        }
    }

    /// Read the register from the chip into the cache.
    pub fn reload<D: AddressableDevice>(&mut self, dev: &mut D) -> Result<()> {
        if self.access == Access::WriteOnly {
            return Err(Error::Unsupported("write-only register cannot be read"));
        }
        let mut buf = [0u8; 4];
        let buf = &mut buf[..usize::from(self.width)];
        dev.read_regs(self.offset, buf)?;
        self.raw = assemble(buf, self.order);
        self.fresh = true;
        tracing::trace!(address = %dev.address(), offset = self.offset, raw = self.raw, "reload");
        Ok(())
    }

    /// Reload and decode.
    pub fn read<D: AddressableDevice>(&mut self, dev: &mut D) -> Result<T> {
        self.reload(dev)?;
        self.data()
    }

    /// Decode the cached value.
    pub fn data(&self) -> Result<T> {
        match self.fresh {
            true => Ok(T::decode(self.raw)),
            false => Err(Error::Stale {
                offset: self.offset,
            }),
        }
    }

    /// Extract one field from the cached value.
    pub fn field(&self, field: Field) -> Result<u32> {
        self.raw()
            .map(|raw| field.extract(raw))
            .ok_or(Error::Stale {
                offset: self.offset,
            })
    }

    /// Overwrite the whole register.  Only correct when `value` owns every bit of it.
    pub fn write<D: AddressableDevice>(&mut self, dev: &mut D, value: &T) -> Result<()> {
        self.store(dev, value.encode())
    }

    /// Change a single field with read-modify-write.  Fails without bus traffic if `value` does
    /// not fit the field or the field does not fit the register.
    pub fn update_field<D: AddressableDevice>(
        &mut self,
        dev: &mut D,
        field: Field,
        value: u32,
    ) -> Result<()> {
        // reject before touching the bus
        if field.mask() & !width_mask(self.width) != 0 {
            return Err(Error::Unsupported("field lies outside the register"));
        }
        let _ = field.insert(0, value)?;
        let old = self.current(dev)?;
        self.store(dev, field.insert(old, value)?)
    }

    /// Change the typed value with read-modify-write.  Bits outside [`RegisterData::MASK`] keep
    /// their current state.  A value with bits beyond the register width is rejected before
    /// anything is written.
    pub fn modify<D, F>(&mut self, dev: &mut D, f: F) -> Result<()>
    where
        D: AddressableDevice,
        F: FnOnce(&mut T),
    {
        let old = self.current(dev)?;
        let mut data = T::decode(old);
        f(&mut data);
        let value = data.encode() & T::MASK;
        if value & !width_mask(self.width) != 0 {
            return Err(Error::OutOfRange {
                value,
                bits: 8 * u32::from(self.width),
            });
        }
        self.store(dev, (old & !T::MASK) | value)
    }

    fn current<D: AddressableDevice>(&mut self, dev: &mut D) -> Result<u32> {
        match self.access {
            Access::ReadOnly | Access::ReadClears => {
                return Err(Error::Unsupported("register is read-only"))
            }
            Access::SelfClearing => self.reload(dev)?,
            Access::WriteOnly if !self.fresh => {
                return Err(Error::Stale {
                    offset: self.offset,
                })
            }
            _ if !self.fresh => self.reload(dev)?,
            _ => {}
        }
        Ok(self.raw)
    }

    fn store<D: AddressableDevice>(&mut self, dev: &mut D, raw: u32) -> Result<()> {
        if matches!(self.access, Access::ReadOnly | Access::ReadClears) {
            return Err(Error::Unsupported("register is read-only"));
        }
        let raw = raw & width_mask(self.width);
        dev.write_regs(self.offset, &split(raw, self.width, self.order))?;
        self.raw = raw;
        self.fresh = true;
        tracing::trace!(address = %dev.address(), offset = self.offset, raw, "store");
        Ok(())
    }
}

fn width_mask(width: u8) -> u32 {
    match width {
        4 => u32::MAX,
        w => (1 << (8 * u32::from(w))) - 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBus, RegisterChip};
    use crate::SharedBus;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::i2c as mock_i2c;

    #[test]
    fn field_math() {
        let f = Field::new(4, 3);
        assert_eq!(f.mask(), 0b0111_0000);
        assert_eq!(f.max(), 7);
        assert_eq!(f.extract(0b1101_0110), 0b101);
        assert_eq!(f.insert(0b1101_0110, 0b010).unwrap(), 0b1010_0110);
        assert!(matches!(
            f.insert(0, 8),
            Err(Error::OutOfRange { value: 8, bits: 3 })
        ));
        assert_eq!(Field::new(0, 32).max(), u32::MAX);
    }

    #[test]
    fn byte_order() {
        assert_eq!(assemble(&[0x12, 0x34], ByteOrder::BigEndian), 0x1234);
        assert_eq!(assemble(&[0x12, 0x34], ByteOrder::LittleEndian), 0x3412);
        assert_eq!(
            assemble(&[0x01, 0x02, 0x03], ByteOrder::LittleEndian),
            0x030201
        );
        assert_eq!(&split(0x1234, 2, ByteOrder::BigEndian)[..], &[0x12, 0x34]);
        assert_eq!(&split(0x1234, 2, ByteOrder::LittleEndian)[..], &[0x34, 0x12]);
        assert_eq!(&split(0xaabbccdd, 1, ByteOrder::BigEndian)[..], &[0xdd]);
    }

    #[test]
    fn stale_until_reload() {
        let expectations = [mock_i2c::Transaction::write_read(0x20, vec![0x03], vec![0xa5])];
        let mut i2c = mock_i2c::Mock::new(&expectations);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x20);

        let mut reg = Register::<u8>::byte(0x03);
        assert!(matches!(reg.data(), Err(Error::Stale { offset: 0x03 })));
        reg.reload(&mut dev).unwrap();
        assert_eq!(reg.data().unwrap(), 0xa5);

        i2c.done();
    }

    #[test]
    fn update_field_reads_once_then_uses_cache() {
        let expectations = [
            mock_i2c::Transaction::write_read(0x20, vec![0x06], vec![0b1111_0000]),
            mock_i2c::Transaction::write(0x20, vec![0x06, 0b1111_0101]),
            mock_i2c::Transaction::write(0x20, vec![0x06, 0b0111_0101]),
        ];
        let mut i2c = mock_i2c::Mock::new(&expectations);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x20);

        let mut reg = Register::<u8>::byte(0x06);
        reg.update_field(&mut dev, Field::new(0, 4), 0b0101).unwrap();
        reg.update_field(&mut dev, Field::bit(7), 0).unwrap();
        assert_eq!(reg.data().unwrap(), 0b0111_0101);

        i2c.done();
    }

    #[test]
    fn oversized_value_never_reaches_the_bus() {
        let mut i2c = mock_i2c::Mock::new(&[]);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x20);

        let mut reg = Register::<u8>::byte(0x06);
        assert!(reg
            .update_field(&mut dev, Field::new(2, 2), 4)
            .unwrap_err()
            .is_validation());

        i2c.done();
    }

    #[test]
    fn self_clearing_reloads_every_time() {
        let expectations = [
            mock_i2c::Transaction::write_read(0x40, vec![0x00], vec![0x11]),
            mock_i2c::Transaction::write(0x40, vec![0x00, 0x91]),
            // the chip cleared bit 7 on its own
            mock_i2c::Transaction::write_read(0x40, vec![0x00], vec![0x11]),
            mock_i2c::Transaction::write(0x40, vec![0x00, 0x01]),
        ];
        let mut i2c = mock_i2c::Mock::new(&expectations);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x40);

        let mut reg = Register::<u8>::byte(0x00).with_access(Access::SelfClearing);
        reg.update_field(&mut dev, Field::bit(7), 1).unwrap();
        reg.update_field(&mut dev, Field::bit(4), 0).unwrap();

        i2c.done();
    }

    #[test]
    fn write_only_uses_shadow() {
        let expectations = [
            mock_i2c::Transaction::write(0x50, vec![0x10, 0x0c]),
            mock_i2c::Transaction::write(0x50, vec![0x10, 0x0d]),
        ];
        let mut i2c = mock_i2c::Mock::new(&expectations);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x50);

        let mut reg = Register::<u8>::byte(0x10)
            .with_access(Access::WriteOnly)
            .with_reset_value(0x08);
        assert!(reg.reload(&mut dev).is_err());
        reg.update_field(&mut dev, Field::bit(2), 1).unwrap();
        reg.update_field(&mut dev, Field::bit(0), 1).unwrap();
        reg.invalidate();
        assert_eq!(reg.data().unwrap(), 0x0d);

        i2c.done();
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut i2c = mock_i2c::Mock::new(&[]);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x20);

        let mut reg = Register::<u8>::byte(0x00).with_access(Access::ReadOnly);
        assert!(reg.write(&mut dev, &0xff).is_err());
        assert!(reg.update_field(&mut dev, Field::bit(0), 1).is_err());

        i2c.done();
    }

    #[test]
    fn field_beyond_register_width_is_rejected() {
        let mut i2c = mock_i2c::Mock::new(&[]);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x20);

        let mut reg = Register::<u8>::byte(0x04);
        assert!(matches!(
            reg.update_field(&mut dev, Field::bit(9), 1),
            Err(Error::Unsupported(_))
        ));
        let mut wide = Register::<u16>::new(0x04, 2, ByteOrder::BigEndian);
        assert!(wide.update_field(&mut dev, Field::new(12, 8), 0).is_err());

        i2c.done();
    }

    #[test]
    fn modify_rejects_values_wider_than_the_register() {
        let chip = RegisterChip::with_registers(&[(0x04, 0x5a)]);
        let bus = SharedBus::with_delay(0, FakeBus::with_chip(0x30, chip), NoopDelay::new());
        let mut dev = bus.device(0x30);

        let mut reg = Register::<u16>::byte(0x04);
        reg.reload(&mut dev).unwrap();
        assert!(matches!(
            reg.modify(&mut dev, |v| *v = 0x01ff),
            Err(Error::OutOfRange { value: 0x01ff, bits: 8 })
        ));

        reg.invalidate();
        assert_eq!(reg.read(&mut dev).unwrap(), 0x5a);
    }

    #[test]
    fn multi_byte_little_endian() {
        let expectations = [
            mock_i2c::Transaction::write_read(0x20, vec![0x00], vec![0xff, 0x0f]),
            mock_i2c::Transaction::write(0x20, vec![0x00, 0xfe, 0x0f]),
        ];
        let mut i2c = mock_i2c::Mock::new(&expectations);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x20);

        let mut reg = Register::<u16>::new(0x00, 2, ByteOrder::LittleEndian);
        assert_eq!(reg.read(&mut dev).unwrap(), 0x0fff);
        reg.update_field(&mut dev, Field::bit(0), 0).unwrap();
        assert_eq!(reg.data().unwrap(), 0x0ffe);

        i2c.done();
    }

    #[test]
    fn multi_byte_big_endian() {
        let expectations = [
            mock_i2c::Transaction::write_read(0x48, vec![0x01], vec![0x85, 0x83]),
            mock_i2c::Transaction::write(0x48, vec![0x01, 0x84, 0x83]),
        ];
        let mut i2c = mock_i2c::Mock::new(&expectations);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x48);

        // ADS1115-style config register: OS | MUX[2:0] | PGA[2:0] | MODE | ...
        let mut reg = Register::<u16>::new(0x01, 2, ByteOrder::BigEndian);
        reg.update_field(&mut dev, Field::bit(8), 0).unwrap();

        i2c.done();
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Ctrl {
        enable: bool,
        rate: u8,
    }

    const ENABLE: Field = Field::bit(7);
    const RATE: Field = Field::new(0, 3);

    impl RegisterData for Ctrl {
        const MASK: u32 = ENABLE.mask() | RATE.mask();

        fn decode(raw: u32) -> Self {
            Self {
                enable: ENABLE.extract(raw) != 0,
                rate: RATE.extract(raw) as u8,
            }
        }

        fn encode(&self) -> u32 {
            (u32::from(self.enable) << ENABLE.shift()) | u32::from(self.rate)
        }
    }

    #[test]
    fn modify_keeps_unmodelled_bits() {
        let expectations = [
            mock_i2c::Transaction::write_read(0x20, vec![0x0a], vec![0b0101_1010]),
            mock_i2c::Transaction::write(0x20, vec![0x0a, 0b1101_1101]),
        ];
        let mut i2c = mock_i2c::Mock::new(&expectations);
        let bus = SharedBus::with_delay(0, i2c.clone(), NoopDelay::new());
        let mut dev = bus.device(0x20);

        let mut reg = Register::<Ctrl>::byte(0x0a);
        reg.modify(&mut dev, |c| {
            c.enable = true;
            c.rate = 0b101;
        })
        .unwrap();
        assert_eq!(
            reg.data().unwrap(),
            Ctrl {
                enable: true,
                rate: 0b101
            }
        );

        i2c.done();
    }

    #[test]
    fn field_write_does_not_clobber_neighbours() {
        let fields = [Field::new(0, 2), Field::new(2, 3), Field::bit(5), Field::new(6, 2)];
        for (i, target) in fields.iter().enumerate() {
            for value in 0..=target.max() {
                let chip = RegisterChip::with_registers(&[(0x04, 0b1001_0110)]);
                let fake = FakeBus::with_chip(0x30, chip);
                let bus = SharedBus::with_delay(0, fake, NoopDelay::new());
                let mut dev = bus.device(0x30);

                let mut reg = Register::<u8>::byte(0x04);
                reg.reload(&mut dev).unwrap();
                let before: Vec<u32> = fields.iter().map(|f| reg.field(*f).unwrap()).collect();

                reg.update_field(&mut dev, *target, value).unwrap();
                reg.invalidate();
                reg.reload(&mut dev).unwrap();

                for (j, f) in fields.iter().enumerate() {
                    let expected = if i == j { value } else { before[j] };
                    assert_eq!(reg.field(*f).unwrap(), expected);
                }
            }
        }
    }
}
