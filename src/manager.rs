//! Discovery and lifecycle of the devices on one bus.
use crate::config::{check_scan_range, DEFAULT_SCAN_END, DEFAULT_SCAN_START};
use crate::{
    BusConfig, BusLock, DeviceAddress, DeviceScheduler, DriverFactory, DriverRegistry, Error,
    Result, SharedBus, StdBusLock,
};
use core::ops::RangeInclusive;
use core::time::Duration;
use embedded_hal::i2c::I2c;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// What a [`BusManager::scan`] found, each list in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScanReport {
    /// Addresses mounted by this scan.
    pub mounted: Vec<DeviceAddress>,
    /// Addresses claimed by more than one driver.  Left unmounted.
    pub ambiguous: Vec<DeviceAddress>,
    /// Addresses that answered but no driver recognised.
    pub unknown: Vec<DeviceAddress>,
}

/// Owns the mounted devices of one bus.
///
/// All schedulers created by a manager share its [`BusLock`], so any two operations on devices of
/// this bus are serialized.  The manager itself is not shared; wrap it in a mutex if several
/// threads need to scan or (re)configure.
pub struct BusManager<I2C, L = StdBusLock> {
    bus: SharedBus<I2C>,
    lock: Arc<L>,
    registry: DriverRegistry<I2C>,
    scan_range: RangeInclusive<u8>,
    active: BTreeMap<DeviceAddress, Arc<DeviceScheduler<L>>>,
    ambiguous: BTreeMap<DeviceAddress, Vec<&'static str>>,
    unknown: BTreeSet<DeviceAddress>,
}

impl<I2C: I2c + Send + 'static> BusManager<I2C, StdBusLock> {
    pub fn new(bus: SharedBus<I2C>, registry: DriverRegistry<I2C>) -> Self {
        Self::with_lock(bus, registry, Arc::new(StdBusLock::default()))
    }
}

impl<I2C, L> BusManager<I2C, L>
where
    I2C: I2c + Send + 'static,
    L: BusLock + 'static,
{
    /// Manager using a caller-supplied lock, e.g. a
    /// [`CriticalSectionLock`](crate::CriticalSectionLock).
    pub fn with_lock(bus: SharedBus<I2C>, registry: DriverRegistry<I2C>, lock: Arc<L>) -> Self {
        Self {
            bus,
            lock,
            registry,
            scan_range: DEFAULT_SCAN_START..=DEFAULT_SCAN_END,
            active: BTreeMap::new(),
            ambiguous: BTreeMap::new(),
            unknown: BTreeSet::new(),
        }
    }

    /// Restrict [`Self::scan`] to `range`.  Ranges reaching past `0x7f` or running backwards are
    /// rejected.
    pub fn set_scan_range(&mut self, range: RangeInclusive<u8>) -> Result<()> {
        check_scan_range(&range)?;
        self.scan_range = range;
        Ok(())
    }

    pub fn bus_index(&self) -> u8 {
        self.bus.index()
    }

    pub fn bus_lock(&self) -> &Arc<L> {
        &self.lock
    }

    pub fn registry(&self) -> &DriverRegistry<I2C> {
        &self.registry
    }

    /// Probe every address of the scan range that is not mounted yet and mount what can be
    /// identified unambiguously.
    ///
    /// The bus lock is taken per address, so mounted devices stay usable during a scan.  A
    /// failing probe means "nothing there" and a failing mount is logged; the scan itself never
    /// fails.
    pub fn scan(&mut self, poll_delay: Duration) -> ScanReport {
        let mut report = ScanReport::default();
        tracing::debug!(bus = self.bus.index(), range = ?self.scan_range, "scanning");

        for address in self.scan_range.clone() {
            let key = self.key(address);
            if self.active.contains_key(&key) {
                continue;
            }

            let bus = &self.bus;
            if self.lock.lock(|| bus.probe(address)) {
                self.identify(key, &mut report);
            } else {
                self.ambiguous.remove(&key);
                self.unknown.remove(&key);
            }

            if !poll_delay.is_zero() {
                std::thread::sleep(poll_delay);
            }
        }

        tracing::info!(
            bus = self.bus.index(),
            mounted = report.mounted.len(),
            ambiguous = report.ambiguous.len(),
            unknown = report.unknown.len(),
            "scan finished"
        );
        report
    }

    fn identify(&mut self, key: DeviceAddress, report: &mut ScanReport) {
        let (bus, registry) = (&self.bus, &self.registry);
        let matches: Vec<DriverFactory<I2C>> = self.lock.lock(|| {
            let mut device = bus.device(key.address());
            registry
                .candidates(key.address())
                .filter(|f| (f.probe)(&mut device))
                .copied()
                .collect()
        });

        match matches.as_slice() {
            [] => {
                tracing::debug!(address = %key, "no driver recognises device");
                self.ambiguous.remove(&key);
                self.unknown.insert(key);
                report.unknown.push(key);
            }
            [factory] => match self.mount(key, *factory) {
                Ok(_) => report.mounted.push(key),
                Err(e) => {
                    tracing::warn!(address = %key, error = %e, "mount during scan failed")
                }
            },
            many => {
                let names: Vec<_> = many.iter().map(|f| f.name).collect();
                tracing::warn!(
                    address = %key,
                    candidates = ?names,
                    "several drivers match, configure one explicitly"
                );
                self.unknown.remove(&key);
                self.ambiguous.insert(key, names);
                report.ambiguous.push(key);
            }
        }
    }

    /// Mount `driver` at `address` without probing.  This is how ambiguous addresses are
    /// resolved.  A device already mounted there is replaced.
    ///
    /// Replacing joins the old device's background tasks, so never call this while holding the
    /// bus lock (e.g. from inside [`DeviceScheduler::with_lock`]).
    pub fn configure_device(
        &mut self,
        address: u8,
        driver: &str,
    ) -> Result<Arc<DeviceScheduler<L>>> {
        let key = self.key(address);
        let factory = *self
            .registry
            .by_name(driver)
            .ok_or_else(|| Error::UnknownDriver(driver.to_owned()))?;
        if !factory.supports(address) {
            return Err(Error::UnsupportedAddress {
                driver: factory.name,
                address: key,
            });
        }
        self.mount(key, factory)
    }

    /// [`Self::configure_device`] for every entry, in address order.  Stops at the first error;
    /// devices configured before it stay mounted.
    pub fn configure_devices(&mut self, devices: &BTreeMap<u8, &str>) -> Result<()> {
        for (address, driver) in devices {
            self.configure_device(*address, driver)?;
        }
        Ok(())
    }

    /// Take the scan range and explicit device table from a configuration.
    pub fn apply_config(&mut self, config: &BusConfig) -> Result<()> {
        if config.bus != self.bus.index() {
            return Err(Error::Unsupported("configuration belongs to another bus"));
        }
        let devices = config.device_map()?;
        self.set_scan_range(config.scan_range())?;
        self.configure_devices(&devices)
    }

    fn mount(
        &mut self,
        key: DeviceAddress,
        factory: DriverFactory<I2C>,
    ) -> Result<Arc<DeviceScheduler<L>>> {
        let device = self.bus.device(key.address());
        let controller = self.lock.lock(|| factory.mount(device))?;
        let scheduler = Arc::new(DeviceScheduler::new(controller, self.lock.clone()));

        if let Some(previous) = self.active.insert(key, scheduler.clone()) {
            tracing::info!(address = %key, driver = previous.name(), "replacing mounted device");
            previous.stop_tasks();
        }
        self.ambiguous.remove(&key);
        self.unknown.remove(&key);
        tracing::info!(address = %key, driver = factory.name, "device mounted");
        Ok(scheduler)
    }

    /// Scheduler mounted at `address`, if any.
    pub fn get(&self, address: u8) -> Option<Arc<DeviceScheduler<L>>> {
        self.active.get(&self.key(address)).cloned()
    }

    /// Like [`Self::get`], but explains why nothing is mounted.
    pub fn require(&self, address: u8) -> Result<Arc<DeviceScheduler<L>>> {
        let key = self.key(address);
        if let Some(scheduler) = self.active.get(&key) {
            return Ok(scheduler.clone());
        }
        match self.ambiguous.get(&key) {
            Some(candidates) => Err(Error::Ambiguous {
                address: key,
                candidates: candidates.clone(),
            }),
            None => Err(Error::NotConfigured(key)),
        }
    }

    /// Remove the device at `address`, stopping its background tasks.
    ///
    /// Never call this while holding the bus lock, see [`DeviceScheduler::stop_tasks`].
    pub fn unmount(&mut self, address: u8) -> Option<Arc<DeviceScheduler<L>>> {
        let key = self.key(address);
        let scheduler = self.active.remove(&key)?;
        scheduler.stop_tasks();
        tracing::info!(address = %key, driver = scheduler.name(), "device unmounted");
        Some(scheduler)
    }

    pub fn devices(&self) -> impl Iterator<Item = (DeviceAddress, &Arc<DeviceScheduler<L>>)> + '_ {
        self.active.iter().map(|(a, s)| (*a, s))
    }

    pub fn ambiguous(&self) -> impl Iterator<Item = (DeviceAddress, &[&'static str])> + '_ {
        self.ambiguous.iter().map(|(a, c)| (*a, c.as_slice()))
    }

    pub fn unknown(&self) -> impl Iterator<Item = DeviceAddress> + '_ {
        self.unknown.iter().copied()
    }

    fn key(&self, address: u8) -> DeviceAddress {
        DeviceAddress::new(self.bus.index(), address)
    }
}
