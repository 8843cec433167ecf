use std::fmt;

use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, get_sockets_info};
use sysinfo::{Pid, System};

/// Process holding a local port.
#[derive(Debug, Clone)]
pub struct ProcessPortInfo {
    pub pid: u32,
    pub process_name: String,
    pub owner: String,
    pub port: u16,
}

impl fmt::Display for ProcessPortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (pid {}, user {}) on port {}",
            self.process_name, self.pid, self.owner, self.port
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

/// Looks up the process listening on `port` for the given protocol.
///
/// Used to make "address already in use" failures actionable. Returns `None`
/// when the socket table cannot be read or no owner can be identified.
pub fn find_process_using_port(port: u16, protocol: TransportProtocol) -> Option<ProcessPortInfo> {
    let proto_flag = match protocol {
        TransportProtocol::Tcp => ProtocolFlags::TCP,
        TransportProtocol::Udp => ProtocolFlags::UDP,
    };

    let sockets = get_sockets_info(
        AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6,
        proto_flag,
    )
    .ok()?;

    let mut system = System::new_all();
    system.refresh_all();

    sockets.into_iter().find_map(|socket| {
        let local_port = match socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(ref tcp) => tcp.local_port,
            ProtocolSocketInfo::Udp(ref udp) => udp.local_port,
        };
        if local_port != port {
            return None;
        }
        build_process_info(&system, port, socket.associated_pids.first())
    })
}

fn build_process_info(system: &System, port: u16, pid: Option<&u32>) -> Option<ProcessPortInfo> {
    let pid = *pid?;
    let process = system.process(Pid::from_u32(pid))?;

    let owner = process
        .user_id()
        .and_then(|uid| {
            users::get_user_by_uid(**uid).map(|user| user.name().to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "unknown".to_string());

    Some(ProcessPortInfo {
        pid,
        process_name: process.name().to_string(),
        owner,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_pid_and_port() {
        let info = ProcessPortInfo {
            pid: 42,
            process_name: "kodi".to_string(),
            owner: "media".to_string(),
            port: 3005,
        };
        let text = info.to_string();
        assert!(text.contains("pid 42"));
        assert!(text.contains("3005"));
    }
}
