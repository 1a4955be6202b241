use crate::{BusLock, DeviceAddress, DeviceController, Error, Reading, Result, StdBusLock};
use core::time::Duration;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

type SharedController = Arc<Mutex<Box<dyn DeviceController>>>;

/// Serialized access to one mounted controller.
///
/// All calls into the controller happen while holding the bus-wide [`BusLock`], shared by every
/// scheduler on the same bus.  Settling delays therefore block other devices too; releasing the
/// lock half-way through a transaction would let another device's transfer land between a
/// command and its response.
pub struct DeviceScheduler<L = StdBusLock> {
    address: DeviceAddress,
    name: &'static str,
    lock: Arc<L>,
    controller: SharedController,
    tasks: Mutex<Vec<BackgroundTask>>,
}

struct BackgroundTask {
    name: String,
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    fn stop(self) {
        self.running.store(false, Ordering::Release);
        self.handle.thread().unpark();
        if self.handle.join().is_err() {
            tracing::warn!(task = %self.name, "background task panicked");
        }
    }
}

impl<L: BusLock + 'static> DeviceScheduler<L> {
    pub fn new(controller: Box<dyn DeviceController>, lock: Arc<L>) -> Self {
        Self {
            address: controller.address(),
            name: controller.name(),
            lock,
            controller: Arc::new(Mutex::new(controller)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Registry name of the mounted driver.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The bus-wide lock shared with every other device on this bus.
    pub fn bus_lock(&self) -> &Arc<L> {
        &self.lock
    }

    /// Run `f` against the controller while holding the bus lock.
    ///
    /// Use this to make a sequence of register/command accesses atomic with respect to all other
    /// devices on the bus.
    pub fn with_lock<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut dyn DeviceController) -> R,
    {
        run_locked(&*self.lock, &self.controller, f)
    }

    pub fn detect(&self) -> Result<bool> {
        self.with_lock(|c| c.detect())
    }

    pub fn configuration(&self) -> Result<Vec<u8>> {
        self.with_lock(|c| c.configuration())
    }

    pub fn state(&self) -> Result<Vec<u8>> {
        self.with_lock(|c| c.state())
    }

    pub fn set_payload(&self, payload: &[u8]) -> Result<()> {
        self.with_lock(|c| c.set_payload(payload))
    }

    pub fn readings(&self) -> Result<Vec<Reading>> {
        self.with_lock(|c| {
            c.as_sensor()
                .map(|s| s.readings())
                .ok_or(Error::Unsupported("device produces no readings"))
        })
    }

    pub fn reset(&self) -> Result<()> {
        self.with_lock(|c| match c.as_resettable() {
            Some(r) => r.reset(),
            None => Err(Error::Unsupported("device cannot be reset")),
        })
    }

    /// Run `task` against the controller every `period` on a dedicated thread.
    ///
    /// The bus lock is held only while `task` runs.  A failing or panicking iteration is logged
    /// and skipped; [`Error::Disconnected`] ends the task.  Tasks stop cooperatively:
    /// [`Self::stop_tasks`] clears a flag the task checks between iterations, an iteration in
    /// flight always completes.
    pub fn spawn_task<F>(&self, name: &str, period: Duration, mut task: F) -> Result<()>
    where
        F: FnMut(&mut dyn DeviceController) -> Result<()> + Send + 'static,
    {
        let name = format!("{}@{}:{}", self.name, self.address, name);
        let running = Arc::new(AtomicBool::new(true));
        let (lock, controller, flag) =
            (self.lock.clone(), self.controller.clone(), running.clone());
        let task_name = name.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                tracing::info!(task = %task_name, "background task started");
                while flag.load(Ordering::Acquire) {
                    let iteration = panic::catch_unwind(AssertUnwindSafe(|| {
                        run_locked(&*lock, &controller, &mut task)
                    }));
                    match iteration {
                        Ok(Ok(())) => {}
                        Ok(Err(Error::Disconnected(address))) => {
                            tracing::info!(
                                task = %task_name,
                                %address,
                                "device disconnected, stopping task"
                            );
                            break;
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(task = %task_name, error = %e, "task iteration failed")
                        }
                        Err(_) => tracing::error!(task = %task_name, "task iteration panicked"),
                    }
                    sleep_unless_stopped(&flag, period);
                }
                flag.store(false, Ordering::Release);
                tracing::info!(task = %task_name, "background task stopped");
            })?;

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BackgroundTask {
                name,
                running,
                handle,
            });
        Ok(())
    }

    /// Number of background tasks that have not finished.
    pub fn running_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|t| t.running.load(Ordering::Acquire))
            .count()
    }

    /// Ask every background task to stop and wait for them.
    ///
    /// Never call this while holding the bus lock: a task waiting for the lock could then never
    /// finish its iteration and the join would block forever.
    pub fn stop_tasks(&self) {
        let tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            core::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.stop();
        }
    }
}

impl<L> Drop for DeviceScheduler<L> {
    fn drop(&mut self) {
        let tasks = core::mem::take(self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.stop();
        }
    }
}

fn run_locked<L, R, F>(lock: &L, controller: &SharedController, f: F) -> R
where
    L: BusLock + ?Sized,
    F: FnOnce(&mut dyn DeviceController) -> R,
{
    lock.lock(|| {
        let mut controller = controller.lock().unwrap_or_else(PoisonError::into_inner);
        f(controller.as_mut())
    })
}

fn sleep_unless_stopped(running: &AtomicBool, period: Duration) {
    let deadline = Instant::now() + period;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::park_timeout(deadline - now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Words};
    use crate::testing::{CommandChip, FakeBus, Op};
    use crate::{AddressableDevice, BusDevice, SharedBus};
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use std::sync::atomic::AtomicUsize;

    struct Sampler {
        dev: BusDevice<FakeBus>,
        measure: Command<Words>,
    }

    impl Sampler {
        fn new(dev: BusDevice<FakeBus>) -> Self {
            Self {
                dev,
                measure: Command::new(0xe000).response_words(2),
            }
        }
    }

    impl DeviceController for Sampler {
        fn name(&self) -> &'static str {
            "sampler"
        }

        fn address(&self) -> DeviceAddress {
            self.dev.address()
        }

        fn detect(&mut self) -> Result<bool> {
            Ok(true)
        }

        fn configuration(&mut self) -> Result<Vec<u8>> {
            Ok(b"{}".to_vec())
        }

        fn state(&mut self) -> Result<Vec<u8>> {
            let words = self.measure.execute(&mut self.dev, &[])?;
            Ok(serde_json::to_vec(&words[..])?)
        }
    }

    fn chip() -> CommandChip {
        CommandChip::new().respond(0xe000, &[0x1234, 0x5678])
    }

    #[derive(Default)]
    struct CountingLock {
        inner: std::sync::Mutex<()>,
        count: AtomicUsize,
    }

    impl BusLock for CountingLock {
        fn lock<R, F: FnOnce() -> R>(&self, f: F) -> R {
            let _guard = self.inner.lock().unwrap();
            self.count.fetch_add(1, Ordering::SeqCst);
            f()
        }
    }

    #[test]
    fn every_call_takes_the_bus_lock() {
        let fake = FakeBus::with_chip(0x44, chip());
        let bus = SharedBus::with_delay(0, fake, NoopDelay::new());
        let lock = Arc::new(CountingLock::default());
        let sched = DeviceScheduler::new(Box::new(Sampler::new(bus.device(0x44))), lock.clone());

        sched.state().unwrap();
        sched.configuration().unwrap();
        assert!(sched.detect().unwrap());
        assert!(matches!(sched.readings(), Err(Error::Unsupported(_))));
        assert!(matches!(sched.reset(), Err(Error::Unsupported(_))));
        assert!(sched.set_payload(b"{}").is_err());

        assert_eq!(lock.count.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn concurrent_transactions_never_interleave() {
        let fake = FakeBus::new();
        fake.attach(0x44, chip());
        fake.attach(0x62, chip());
        fake.set_transfer_delay(Duration::from_micros(200));
        let bus = SharedBus::with_delay(0, fake.clone(), NoopDelay::new());
        let lock = Arc::new(StdBusLock::default());

        let schedulers: Vec<_> = [0x44, 0x62]
            .into_iter()
            .map(|a| {
                Arc::new(DeviceScheduler::new(
                    Box::new(Sampler::new(bus.device(a))),
                    lock.clone(),
                ))
            })
            .collect();

        let workers: Vec<_> = schedulers
            .iter()
            .flat_map(|s| [s.clone(), s.clone()])
            .map(|s| {
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        s.state().unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let log = fake.log();
        assert_eq!(log.len(), 4 * 25 * 2);
        for pair in log.chunks(2) {
            match pair {
                [Op::Write(a), Op::Read(b)] => assert_eq!(a, b, "interleaved: {:?}", pair),
                other => panic!("interleaved transaction: {:?}", other),
            }
        }
    }

    #[test]
    fn composite_operation_is_atomic() {
        let fake = FakeBus::new();
        fake.attach(0x44, chip());
        fake.attach(0x62, chip());
        fake.set_transfer_delay(Duration::from_micros(200));
        let bus = SharedBus::with_delay(0, fake.clone(), NoopDelay::new());
        let lock = Arc::new(StdBusLock::default());
        let sampler_at = |address| Box::new(Sampler::new(bus.device(address)));
        let a = Arc::new(DeviceScheduler::new(sampler_at(0x44), lock.clone()));
        let b = Arc::new(DeviceScheduler::new(sampler_at(0x62), lock));

        let other = {
            let b = b.clone();
            std::thread::spawn(move || {
                for _ in 0..20 {
                    b.state().unwrap();
                }
            })
        };
        for _ in 0..5 {
            a.with_lock(|c| {
                for _ in 0..3 {
                    c.state().unwrap();
                }
            });
        }
        other.join().unwrap();

        // every burst of the composite operation is six consecutive transfers to 0x44
        let log = fake.log();
        let mut i = 0;
        while i < log.len() {
            if log[i] == Op::Write(0x44) {
                assert!(log[i..i + 6]
                    .iter()
                    .all(|op| matches!(op, Op::Write(0x44) | Op::Read(0x44))));
                i += 6;
            } else {
                i += 1;
            }
        }
    }

    #[test]
    fn background_task_survives_failures_and_stops() {
        let fake = FakeBus::with_chip(0x44, chip());
        let bus = SharedBus::with_delay(0, fake.clone(), NoopDelay::new());
        let sched = DeviceScheduler::new(
            Box::new(Sampler::new(bus.device(0x44))),
            Arc::new(StdBusLock::default()),
        );

        let ok = Arc::new(AtomicUsize::new(0));
        let counter = ok.clone();
        fake.set_failing(0x44, true);
        sched
            .spawn_task("refresh", Duration::from_millis(1), move |c| {
                c.state()?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(sched.running_tasks(), 1);

        fake.set_failing(0x44, false);
        let deadline = Instant::now() + Duration::from_secs(5);
        while ok.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(ok.load(Ordering::SeqCst) > 0);

        sched.stop_tasks();
        assert_eq!(sched.running_tasks(), 0);
        let after = ok.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(ok.load(Ordering::SeqCst), after);
    }

    #[test]
    fn disconnect_ends_task() {
        let fake = FakeBus::with_chip(0x44, chip());
        let bus = SharedBus::with_delay(0, fake, NoopDelay::new());
        let sched = DeviceScheduler::new(
            Box::new(Sampler::new(bus.device(0x44))),
            Arc::new(StdBusLock::default()),
        );

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        sched
            .spawn_task("watch", Duration::from_millis(1), move |c| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Disconnected(c.address()))
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sched.running_tasks() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(sched.running_tasks(), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_iteration_is_skipped() {
        let fake = FakeBus::with_chip(0x44, chip());
        let bus = SharedBus::with_delay(0, fake, NoopDelay::new());
        let sched = DeviceScheduler::new(
            Box::new(Sampler::new(bus.device(0x44))),
            Arc::new(StdBusLock::default()),
        );

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        sched
            .spawn_task("faulty", Duration::from_millis(1), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("driver bug");
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(sched.running_tasks(), 1);

        // the lock and controller stay usable after the panics
        assert_eq!(sched.state().unwrap(), b"[4660,22136]".to_vec());

        sched.stop_tasks();
        assert_eq!(sched.running_tasks(), 0);
    }

    #[test]
    fn stop_does_not_wait_for_a_long_period() {
        let fake = FakeBus::with_chip(0x44, chip());
        let bus = SharedBus::with_delay(0, fake, NoopDelay::new());
        let sched = DeviceScheduler::new(
            Box::new(Sampler::new(bus.device(0x44))),
            Arc::new(StdBusLock::default()),
        );
        sched
            .spawn_task("slow", Duration::from_secs(3600), |c| c.state().map(drop))
            .unwrap();

        let started = Instant::now();
        drop(sched);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
