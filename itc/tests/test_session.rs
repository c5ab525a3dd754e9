use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use itc::accounting::{IdleAccountingService, ManualClock};
use itc::config::ServiceConfig;
use itc::device::protocol::decode;
use itc::device::DeviceSession;
use itc::domain::ItcError;
use itc::hook::{EmulatedHost, EmulatedIdleSource};

/// Writer that fails like a bad user pointer
struct FaultingWriter;

impl Write for FaultingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::EFAULT))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn emulated_device(cpus: u32) -> (DeviceSession<EmulatedIdleSource>, Arc<EmulatedHost>, Arc<ManualClock>) {
    let host = EmulatedHost::start(cpus).unwrap();
    let clock = Arc::new(ManualClock::new());
    let service = Arc::new(IdleAccountingService::new(
        &ServiceConfig { max_cpus: cpus as usize },
        clock.clone(),
        Arc::new(host.topology()),
    ));
    (DeviceSession::new(service, EmulatedIdleSource::new(host.clone())), host, clock)
}

#[test]
fn test_open_twice_then_reopen() {
    let (device, host, _) = emulated_device(2);

    let reader = device.open().unwrap();
    let err = device.open().err().unwrap();
    assert!(matches!(err, ItcError::AlreadyInUse));
    assert_eq!(err.errno(), libc::EALREADY);

    reader.release();
    let reader = device.open().expect("reopen after release");
    assert!(host.slot().current().unwrap().is_interceptor());
    reader.release();
    assert!(!host.slot().current().unwrap().is_interceptor());

    host.shutdown();
}

#[test]
fn test_read_to_reports_copy_fault_after_snapshot() {
    let (device, host, clock) = emulated_device(2);
    let reader = device.open().unwrap();

    let mut sink = Vec::new();
    assert!(matches!(reader.read_to(31, &mut sink), Err(ItcError::InvalidArgument(_))));
    assert!(sink.is_empty());

    let before = device.service().snapshot().unwrap();
    clock.advance(Duration::from_secs(1));
    let err = reader.read_to(32, &mut FaultingWriter).unwrap_err();
    assert!(matches!(err, ItcError::CopyFault(_)));
    assert_eq!(err.errno(), libc::EFAULT);

    // Only delivery failed; the totals are intact
    let after = device.service().snapshot().unwrap();
    for (a, b) in before.durations().iter().zip(after.durations()) {
        assert!(b >= *a);
    }

    assert_eq!(reader.read_to(64, &mut sink).unwrap(), 32);
    assert_eq!(decode(&sink).unwrap().len(), 2);

    reader.release();
    host.shutdown();
}

#[test]
fn test_ioctl_is_rejected() {
    let (device, host, _) = emulated_device(1);
    let reader = device.open().unwrap();
    assert!(matches!(reader.ioctl(0, 0), Err(ItcError::NotSupported(_))));
    drop(reader);
    assert!(!device.is_open());
    host.shutdown();
}
