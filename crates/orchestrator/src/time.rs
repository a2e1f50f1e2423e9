use std::time::{SystemTime, UNIX_EPOCH};

pub fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

pub fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}
