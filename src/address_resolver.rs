//! Which hardware addresses are ours, and which answer for the
//! master.

use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use cj_path_util::path_util::AppendToPath;

use crate::{
    command::run_stdout,
    hwaddr::{AddressSet, HwAddr, HwAddrParseError, LocalIdentity, MasterProbeResult},
};

/// `ARPHRD_ETHER` from linux/if_arp.h, as shown in
/// `/sys/class/net/*/type`.
const ARPHRD_ETHER: u32 = 1;

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("enumerating network interfaces in {path:?}: {error}")]
    InterfaceEnumeration {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("interface address file {path:?}: {error}")]
    MalformedInterfaceAddress {
        path: PathBuf,
        error: HwAddrParseError,
    },
    #[error("no hardware addresses found on any interface in {0:?}")]
    EmptyLocalIdentity(PathBuf),
    #[error("probing master {host:?}: {error:#}")]
    ProbeTool { host: String, error: anyhow::Error },
    #[error("probing master {host:?}: malformed reply line {line:?}")]
    MalformedReply { host: String, line: String },
}

pub trait AddressResolver {
    /// The addresses of all local (non-loopback) interfaces. Errors
    /// out instead of returning an empty set.
    fn local_identity(&self) -> Result<LocalIdentity, ProbeError>;

    /// The addresses answering for `host` right now. No reply is the
    /// empty set, not an error.
    fn probe_master(&self, host: &str) -> Result<MasterProbeResult, ProbeError>;
}

/// Parse the output of iputils `arping`: the address between the
/// brackets of every line mentioning a reply, as in
/// `Unicast reply from 10.0.0.5 [52:54:00:12:34:56]  0.611ms`.
pub fn parse_arping_output(host: &str, output: &str) -> Result<MasterProbeResult, ProbeError> {
    let malformed = |line: &str| ProbeError::MalformedReply {
        host: host.into(),
        line: line.into(),
    };
    let mut addresses = AddressSet::new();
    for line in output.lines() {
        if !line.contains("reply") {
            continue;
        }
        let (_, rest) = line.split_once('[').ok_or_else(|| malformed(line))?;
        let (addr, _) = rest.split_once(']').ok_or_else(|| malformed(line))?;
        addresses.insert(addr.parse().map_err(|_| malformed(line))?);
    }
    Ok(addresses.into_iter().collect())
}

/// Interfaces from sysfs, master probing via the `arping` program.
#[derive(Debug, Clone)]
pub struct SystemAddressResolver {
    /// Usually `/sys/class/net`.
    pub interface_path: PathBuf,
    pub arping_program: PathBuf,
    /// Number of ARP requests sent per probe.
    pub attempts: NonZeroU32,
    /// Per attempt.
    pub timeout: Duration,
}

impl SystemAddressResolver {
    fn read_interface(&self, dir: &Path) -> Result<Option<HwAddr>, ProbeError> {
        let enumeration = |error| ProbeError::InterfaceEnumeration {
            path: dir.into(),
            error,
        };
        let interface_type = std::fs::read_to_string(dir.append("type")).map_err(enumeration)?;
        if interface_type.trim().parse::<u32>().ok() != Some(ARPHRD_ETHER) {
            return Ok(None);
        }
        let address_path = dir.append("address");
        let address = std::fs::read_to_string(&address_path).map_err(enumeration)?;
        let address: HwAddr =
            address
                .parse()
                .map_err(|error| ProbeError::MalformedInterfaceAddress {
                    path: address_path,
                    error,
                })?;
        if address.is_zero() {
            Ok(None)
        } else {
            Ok(Some(address))
        }
    }
}

/// arping's `-w`, the deadline for the whole run: at least a second
/// per attempt.
pub fn arping_deadline_seconds(timeout: Duration, attempts: NonZeroU32) -> u64 {
    timeout.as_secs().max(1).saturating_mul(u64::from(attempts.get()))
}

impl AddressResolver for SystemAddressResolver {
    fn local_identity(&self) -> Result<LocalIdentity, ProbeError> {
        let enumeration = |error| ProbeError::InterfaceEnumeration {
            path: self.interface_path.clone(),
            error,
        };
        let mut addresses = AddressSet::new();
        for entry in std::fs::read_dir(&self.interface_path).map_err(enumeration)? {
            let entry = entry.map_err(enumeration)?;
            if entry.file_name() == "lo" {
                continue;
            }
            if let Some(address) = self.read_interface(&entry.path())? {
                addresses.insert(address);
            }
        }
        LocalIdentity::new(addresses)
            .ok_or_else(|| ProbeError::EmptyLocalIdentity(self.interface_path.clone()))
    }

    fn probe_master(&self, host: &str) -> Result<MasterProbeResult, ProbeError> {
        let attempts = self.attempts.to_string();
        let deadline = arping_deadline_seconds(self.timeout, self.attempts).to_string();
        // Exit code 1: no reply.
        let (_code, stdout) = run_stdout(
            &self.arping_program,
            &["-c", attempts.as_str(), "-w", deadline.as_str(), host],
            &[0, 1],
        )
        .map_err(|error| ProbeError::ProbeTool {
            host: host.into(),
            error,
        })?;
        parse_arping_output(host, &String::from_utf8_lossy(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARPING_TWO_REPLIES: &str = "\
ARPING 10.0.0.5 from 10.0.0.7 eth0
Unicast reply from 10.0.0.5 [52:54:00:12:34:56]  0.611ms
Unicast reply from 10.0.0.5 [52:54:00:AB:CD:EF]  0.702ms
Unicast reply from 10.0.0.5 [52:54:00:12:34:56]  0.598ms
Sent 2 probes (1 broadcast(s))
Received 3 response(s)
";

    const ARPING_NO_REPLY: &str = "\
ARPING 10.0.0.5 from 10.0.0.7 eth0
Sent 2 probes (2 broadcast(s))
Received 0 response(s)
";

    #[test]
    fn t_parse_arping_output() {
        let result = parse_arping_output("mfsmaster", ARPING_TWO_REPLIES).unwrap();
        assert_eq!(result.to_string(), "{52:54:00:12:34:56, 52:54:00:ab:cd:ef}");
        assert!(parse_arping_output("mfsmaster", ARPING_NO_REPLY)
            .unwrap()
            .is_empty());
        assert!(matches!(
            parse_arping_output("mfsmaster", "Unicast reply from 10.0.0.5 52:54:00:12:34:56"),
            Err(ProbeError::MalformedReply { .. })
        ));
    }

    fn fake_interface(root: &Path, name: &str, interface_type: u32, address: &str) {
        let dir = root.join(name);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("type"), format!("{interface_type}\n")).unwrap();
        std::fs::write(dir.join("address"), format!("{address}\n")).unwrap();
    }

    fn resolver(interface_path: &Path) -> SystemAddressResolver {
        SystemAddressResolver {
            interface_path: interface_path.into(),
            arping_program: "arping".into(),
            attempts: NonZeroU32::new(2).unwrap(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn t_local_identity_from_sysfs() {
        let dir = tempfile::tempdir().unwrap();
        fake_interface(dir.path(), "lo", 772, "00:00:00:00:00:00");
        fake_interface(dir.path(), "eth0", 1, "52:54:00:12:34:56");
        fake_interface(dir.path(), "eth1", 1, "52:54:00:ab:cd:ef");
        fake_interface(dir.path(), "dummy0", 1, "00:00:00:00:00:00");
        fake_interface(dir.path(), "tun0", 65534, "");
        let local = resolver(dir.path()).local_identity().unwrap();
        assert_eq!(local.to_string(), "{52:54:00:12:34:56, 52:54:00:ab:cd:ef}");
    }

    #[test]
    fn t_empty_local_identity_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fake_interface(dir.path(), "lo", 772, "00:00:00:00:00:00");
        assert!(matches!(
            resolver(dir.path()).local_identity(),
            Err(ProbeError::EmptyLocalIdentity(_))
        ));
        assert!(matches!(
            resolver(&dir.path().join("missing")).local_identity(),
            Err(ProbeError::InterfaceEnumeration { .. })
        ));
    }

    #[test]
    fn t_malformed_interface_address() {
        let dir = tempfile::tempdir().unwrap();
        fake_interface(dir.path(), "eth0", 1, "52:54:00:12:34");
        assert!(matches!(
            resolver(dir.path()).local_identity(),
            Err(ProbeError::MalformedInterfaceAddress { .. })
        ));
    }

    #[test]
    fn t_arping_deadline() {
        let n = |n| NonZeroU32::new(n).unwrap();
        assert_eq!(arping_deadline_seconds(Duration::from_secs(1), n(2)), 2);
        assert_eq!(arping_deadline_seconds(Duration::ZERO, n(3)), 3);
        assert_eq!(arping_deadline_seconds(Duration::from_millis(2500), n(2)), 4);
        assert_eq!(
            arping_deadline_seconds(Duration::from_secs(u64::MAX / 2), n(u32::MAX)),
            u64::MAX
        );
    }
}
