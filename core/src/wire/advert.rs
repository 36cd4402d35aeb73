//! UDP advert datagrams for indexnode discovery and auto-indexnode
//! election.
//!
//! Two formats, both plain UTF-8:
//!
//! ```text
//! active:      <protoVer>:<port>:<advertUID>
//! prospective: <protoVer>:autoindexnode:<capability>:<advertUID>
//! ```

use crate::protocol::constants::FS2_PROTOCOL_VERSION;

/// A parsed advert datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advert {
    /// "There is a running indexnode on this port."
    Active { port: u16, advert_uid: u64 },
    /// "I could run an indexnode this well, if needed."
    Prospective { capability: u64, advert_uid: u64 },
}

impl Advert {
    pub fn advert_uid(&self) -> u64 {
        match self {
            Advert::Active { advert_uid, .. } => *advert_uid,
            Advert::Prospective { advert_uid, .. } => *advert_uid,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Advert::Active { port, advert_uid } => {
                format!("{}:{}:{}", FS2_PROTOCOL_VERSION, port, advert_uid)
            }
            Advert::Prospective {
                capability,
                advert_uid,
            } => format!(
                "{}:autoindexnode:{}:{}",
                FS2_PROTOCOL_VERSION, capability, advert_uid
            ),
        }
    }

    /// Parse a datagram. Datagrams from other protocol versions or with
    /// any malformed field yield None and are ignored by listeners.
    pub fn parse(datagram: &str) -> Option<Advert> {
        let rest = datagram.strip_prefix(FS2_PROTOCOL_VERSION)?;
        let rest = rest.strip_prefix(':')?;
        if let Some(rest) = rest.strip_prefix("autoindexnode:") {
            let (capability, advert_uid) = rest.split_once(':')?;
            Some(Advert::Prospective {
                capability: capability.parse().ok()?,
                advert_uid: advert_uid.parse().ok()?,
            })
        } else {
            let (port, advert_uid) = rest.split_once(':')?;
            Some(Advert::Active {
                port: port.parse().ok()?,
                advert_uid: advert_uid.parse().ok()?,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_round_trip() {
        let advert = Advert::Active {
            port: 42424,
            advert_uid: 987654321,
        };
        let s = advert.encode();
        assert_eq!(s, format!("{}:42424:987654321", FS2_PROTOCOL_VERSION));
        assert_eq!(Advert::parse(&s), Some(advert));
    }

    #[test]
    fn prospective_round_trip() {
        let advert = Advert::Prospective {
            capability: 12_400_000,
            advert_uid: 55,
        };
        let s = advert.encode();
        assert!(s.contains(":autoindexnode:"));
        assert_eq!(Advert::parse(&s), Some(advert));
    }

    #[test]
    fn rejects_foreign_versions() {
        assert_eq!(Advert::parse("FS2_12:42424:1"), None);
        assert_eq!(Advert::parse("HTTP/1.1 200 OK"), None);
        assert_eq!(Advert::parse(""), None);
    }

    #[test]
    fn rejects_malformed_fields() {
        let bad_port = format!("{}:notaport:1", FS2_PROTOCOL_VERSION);
        assert_eq!(Advert::parse(&bad_port), None);
        let missing_uid = format!("{}:42424", FS2_PROTOCOL_VERSION);
        assert_eq!(Advert::parse(&missing_uid), None);
        let bad_cap = format!("{}:autoindexnode:x:1", FS2_PROTOCOL_VERSION);
        assert_eq!(Advert::parse(&bad_cap), None);
    }
}
