use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use itc::accounting::{Clock, IdleAccountingService, MonotonicClock};
use itc::config::ServiceConfig;
use itc::device::DeviceSession;
use itc::domain::{CpuId, ItcError};
use itc::hook::{EmulatedHost, EmulatedIdleSource, IdleEventSource, SourceStats};
use itc::topology::FixedTopology;

struct Passive;

impl IdleEventSource for Passive {
    fn name(&self) -> &'static str {
        "passive"
    }

    fn install(&mut self, _sink: Arc<IdleAccountingService>) -> Result<(), ItcError> {
        Ok(())
    }

    fn uninstall(&mut self) -> Result<SourceStats, ItcError> {
        Ok(SourceStats::default())
    }

    fn wake_all_cpus(&self) -> Result<(), ItcError> {
        Ok(())
    }
}

fn monotonic_service(cpus: u32) -> Arc<IdleAccountingService> {
    Arc::new(IdleAccountingService::new(
        &ServiceConfig { max_cpus: cpus as usize },
        Arc::new(MonotonicClock),
        Arc::new(FixedTopology::with_count(cpus)),
    ))
}

#[test]
fn test_concurrent_events_never_tear_a_snapshot() {
    let service = monotonic_service(3);
    let session = DeviceSession::new(service.clone(), Passive);
    let origin = service.now();
    let stop = AtomicBool::new(false);

    let reader = session.open().unwrap();

    thread::scope(|s| {
        for cpu in [CpuId(0), CpuId(1)] {
            let service = &service;
            let stop = &stop;
            s.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    service.on_idle_enter(cpu);
                    thread::yield_now();
                    service.on_idle_exit(cpu);
                }
            });
        }

        let mut last = vec![Duration::ZERO; 3];
        for _ in 0..2000 {
            let snap = reader.snapshot().unwrap();
            let elapsed = snap.taken_at - origin;

            for (i, cpu) in snap.cpus.iter().enumerate() {
                assert!(cpu.idle >= last[i], "CPU {} went backwards", cpu.cpu);
                assert!(cpu.idle <= elapsed, "CPU {} idle {:?} > elapsed {elapsed:?}", cpu.cpu, cpu.idle);
                last[i] = cpu.idle;
            }
            // CPU 2 never idles
            assert_eq!(snap.cpus[2].idle, Duration::ZERO);
        }

        stop.store(true, Ordering::Relaxed);
    });

    reader.release();
    println!("✅ 2000 snapshots consistent under concurrent idle events");
}

#[test]
fn test_racing_opens_admit_one_reader() {
    let session = DeviceSession::new(monotonic_service(1), Passive);
    let threads = 8;
    let barrier = Barrier::new(threads);
    let admitted = AtomicUsize::new(0);
    let refused = AtomicUsize::new(0);
    let hold = Barrier::new(threads);

    thread::scope(|s| {
        for _ in 0..threads {
            s.spawn(|| {
                barrier.wait();
                let result = session.open();
                match &result {
                    Ok(_) => admitted.fetch_add(1, Ordering::SeqCst),
                    Err(ItcError::AlreadyInUse) => refused.fetch_add(1, Ordering::SeqCst),
                    Err(e) => panic!("unexpected error: {e}"),
                };
                // Keep the winner open until every thread has tried
                hold.wait();
                drop(result);
            });
        }
    });

    assert_eq!(admitted.load(Ordering::SeqCst), 1);
    assert_eq!(refused.load(Ordering::SeqCst), threads - 1);
    assert!(!session.is_open());
}

#[test]
fn test_emulated_host_end_to_end() {
    let host = EmulatedHost::start(4).unwrap();
    let service = monotonic_service(4);
    let session = DeviceSession::new(service.clone(), EmulatedIdleSource::new(host.clone()));
    let opened_at = MonotonicClock.now();

    let reader = session.open().unwrap();
    host.submit(CpuId(3), Duration::from_millis(200));
    thread::sleep(Duration::from_millis(250));

    let first = reader.read_records().unwrap();
    thread::sleep(Duration::from_millis(50));
    let second = reader.read_records().unwrap();
    let stats = reader.release();

    let wall = MonotonicClock.now() - opened_at;
    assert_eq!(first.len(), 4);
    for (a, b) in first.iter().zip(&second) {
        assert!(b >= a);
        assert!(b.to_duration() <= wall);
    }
    assert!(first[3] < first[0], "busy CPU 3 should have idled less than CPU 0");
    assert!(stats.delivered > 0);

    // Host idles natively again and totals stop moving
    assert!(!host.slot().current().unwrap().is_interceptor());
    let settled = service.snapshot().unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(service.snapshot().unwrap().durations(), settled.durations());

    host.shutdown();
}
