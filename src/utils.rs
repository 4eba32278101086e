use chrono::{DateTime, FixedOffset, Utc};
use rand::Rng;

pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let mut rng = rand::thread_rng();
    rng.fill(&mut peer_id);
    peer_id
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Current wall-clock time in JST (UTC+9), the timezone evidence is stamped in.
pub fn jst_now() -> DateTime<FixedOffset> {
    let jst = FixedOffset::east_opt(9 * 3600).unwrap();
    Utc::now().with_timezone(&jst)
}

/// Evidence timestamp format, e.g. `2024-02-29 09:30:00`.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}
