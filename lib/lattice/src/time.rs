use std::time::SystemTime;

/// Offset between the POSIX epoch (1970-01-01) and the EPICS epoch
/// (1990-01-01), in seconds.
pub const EPICS_EPOCH_OFFSET: u64 = 631_152_000;

const NANOS_PER_SEC: f64 = 1e9;

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the current unix timestamp with sub-second resolution.
#[inline]
pub fn timestamp_posix() -> f64 {
    let elapsed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised");

    elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) / NANOS_PER_SEC
}

/// Converts a POSIX timestamp to EPICS epoch (seconds, nanoseconds).
/// Timestamps predating the EPICS epoch clamp to zero.
#[inline]
pub fn posix_to_epics(posix: f64) -> (u32, u32) {
    let epics = posix - EPICS_EPOCH_OFFSET as f64;

    if epics <= 0.0 {
        return (0, 0);
    }

    let secs = epics.trunc();
    let nsec = ((epics - secs) * NANOS_PER_SEC).round();

    if nsec >= NANOS_PER_SEC {
        (secs as u32 + 1, 0)
    } else {
        (secs as u32, nsec as u32)
    }
}

/// Converts an EPICS epoch (seconds, nanoseconds) pair to a POSIX timestamp.
#[inline]
pub fn epics_to_posix(secs: u32, nsec: u32) -> f64 {
    (u64::from(secs) + EPICS_EPOCH_OFFSET) as f64 + f64::from(nsec) / NANOS_PER_SEC
}
