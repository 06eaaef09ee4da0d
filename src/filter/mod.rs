//! Interception filters
//!
//! [`IpFilter`] decides by destination address and [`AppFilter`] by
//! originating process. [`CaptureGate`] combines the two for packet
//! sources that divert traffic at the kernel boundary.

mod app;
mod geoip;
mod ip;
mod prefix;

pub use app::{AppFilter, AppFilterWriter, ProcessResolver, ProcfsResolver};
pub use geoip::{CidrGeoIp, GeoIpSource};
pub use ip::{IpFilter, IpFilterWriter};
pub use prefix::PrefixTable;

use std::net::SocketAddr;
use std::sync::Arc;

/// Capture decision for diverted packets
#[derive(Debug, Clone)]
pub struct CaptureGate {
    ip: Arc<IpFilter>,
    app: Option<Arc<AppFilter>>,
    hijack_dns: bool,
}

impl CaptureGate {
    /// Combine the filters
    pub fn new(ip: Arc<IpFilter>, app: Option<Arc<AppFilter>>, hijack_dns: bool) -> Self {
        CaptureGate { ip, app, hijack_dns }
    }

    /// Whether a packet from process `pid` to `dst` should be captured
    ///
    /// DNS is always captured while hijacking is on; otherwise a covered
    /// process or a covered destination is enough.
    pub fn should_capture(&self, pid: Option<u32>, dst: SocketAddr) -> bool {
        if self.hijack_dns && dst.port() == 53 {
            return true;
        }
        if let (Some(app), Some(pid)) = (&self.app, pid) {
            if app.covers_pid(pid) {
                return true;
            }
        }
        self.ip.covers(dst.ip())
    }
}
