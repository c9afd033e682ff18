//! Path dialer (component H): races a direct dial against relayed dials to
//! the same target peer and returns whichever wins.
//!
//! The DHT lookup, transport dial, and circuit-address dial are all
//! external collaborators (secured transport and relay protocol live
//! outside this crate); this module only owns the race, deadline, and
//! result classification around them.

use std::future::Future;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;

use crate::error::{OverlayError, Result};
use crate::identity::PeerId;

pub const OVERALL_DIAL_DEADLINE: Duration = Duration::from_secs(45);

/// Happy-Eyeballs-style handicap: an IPv4 candidate's dial attempt is
/// delayed by this much relative to IPv6 candidates, so IPv6 wins the race
/// whenever it is at least this close to as fast, without IPv4 waiting for
/// IPv6 to fail outright.
const IPV4_HANDICAP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathType {
    Direct,
    Relayed,
}

#[derive(Debug, Clone)]
pub struct PathResult {
    pub path_type: PathType,
    pub address: String,
    pub latency: Duration,
}

/// Candidate address to dial directly, tagged so direct dials can prefer
/// IPv6 when it is globally reachable and fall back to IPv4 otherwise.
#[derive(Debug, Clone)]
pub struct DirectCandidate {
    pub address: String,
    pub ip: IpAddr,
}

/// Race a direct dial -- every candidate attempted concurrently, IPv6
/// given a head start per the Happy-Eyeballs handicap above -- against a
/// relayed dial over each of `relay_addresses` (also concurrent), and
/// return the first winner overall. The loser side is dropped, cancelling
/// its in-flight futures.
pub async fn dial_with_race<DirFut, RelFut>(
    _target: &PeerId,
    direct_candidates: Vec<DirectCandidate>,
    relay_addresses: Vec<String>,
    dial_direct: impl Fn(DirectCandidate) -> DirFut,
    dial_relayed: impl Fn(String) -> RelFut,
) -> Result<PathResult>
where
    DirFut: Future<Output = Result<()>>,
    RelFut: Future<Output = Result<()>>,
{
    let started = Instant::now();

    let direct_race = async {
        let mut attempts = FuturesUnordered::new();
        for candidate in direct_candidates {
            let handicap = match candidate.ip {
                IpAddr::V6(_) => Duration::ZERO,
                IpAddr::V4(_) => IPV4_HANDICAP,
            };
            let address = candidate.address.clone();
            let attempt = &dial_direct;
            attempts.push(async move {
                if !handicap.is_zero() {
                    tokio::time::sleep(handicap).await;
                }
                attempt(candidate).await.map(|()| address)
            });
        }
        while let Some(result) = attempts.next().await {
            if let Ok(address) = result {
                return Some(address);
            }
        }
        None
    };

    let relayed_race = async {
        let mut attempts = FuturesUnordered::new();
        for address in relay_addresses {
            let attempt = &dial_relayed;
            let attempt_address = address.clone();
            attempts.push(async move { attempt(address).await.map(|()| attempt_address) });
        }
        while let Some(result) = attempts.next().await {
            if let Ok(address) = result {
                return Some(address);
            }
        }
        None
    };

    let deadline = tokio::time::sleep(OVERALL_DIAL_DEADLINE);
    tokio::pin!(deadline);
    tokio::pin!(direct_race);
    tokio::pin!(relayed_race);

    tokio::select! {
        Some(address) = &mut direct_race => Ok(PathResult {
            path_type: PathType::Direct,
            address,
            latency: started.elapsed(),
        }),
        Some(address) = &mut relayed_race => Ok(PathResult {
            path_type: PathType::Relayed,
            address,
            latency: started.elapsed(),
        }),
        _ = &mut deadline => Err(OverlayError::network_transient("no path to peer within deadline")),
        else => Err(OverlayError::network_transient("no path to peer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> PeerId {
        PeerId(hex::encode([1u8; 32]))
    }

    #[tokio::test]
    async fn direct_dial_wins_when_it_succeeds_first() {
        let candidates = vec![DirectCandidate {
            address: "/ip4/203.0.113.4/tcp/4242".to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 4)),
        }];
        let relays = vec!["relay-addr".to_string()];

        let result = dial_with_race(
            &peer(),
            candidates,
            relays,
            |_c| async move { Ok(()) },
            |_addr| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            },
        )
        .await
        .unwrap();

        assert_eq!(result.path_type, PathType::Direct);
    }

    #[tokio::test]
    async fn relayed_dial_wins_when_direct_fails() {
        let candidates = vec![DirectCandidate {
            address: "/ip4/203.0.113.4/tcp/4242".to_string(),
            ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 4)),
        }];
        let relays = vec!["relay-addr".to_string()];

        let result = dial_with_race(
            &peer(),
            candidates,
            relays,
            |_c| async move { Err(OverlayError::network_transient("unreachable")) },
            |_addr| async move { Ok(()) },
        )
        .await
        .unwrap();

        assert_eq!(result.path_type, PathType::Relayed);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reachable_path_is_a_transient_error() {
        let result = dial_with_race(
            &peer(),
            vec![],
            vec![],
            |_c: DirectCandidate| async move { Ok(()) },
            |_addr: String| async move { Ok(()) },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ipv6_wins_the_happy_eyeballs_race_when_both_succeed() {
        let candidates = vec![
            DirectCandidate {
                address: "v4".to_string(),
                ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 4)),
            },
            DirectCandidate {
                address: "v6".to_string(),
                ip: "2001:db8::1".parse().unwrap(),
            },
        ];

        let result = dial_with_race(
            &peer(),
            candidates,
            vec![],
            |_c| async move { Ok(()) },
            |_addr: String| async move { Err(OverlayError::network_transient("fail")) },
        )
        .await
        .unwrap();

        assert_eq!(result.address, "v6");
    }

    #[tokio::test(start_paused = true)]
    async fn ipv4_wins_when_ipv6_fails_outright() {
        let candidates = vec![
            DirectCandidate {
                address: "v4".to_string(),
                ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 4)),
            },
            DirectCandidate {
                address: "v6".to_string(),
                ip: "2001:db8::1".parse().unwrap(),
            },
        ];

        let result = dial_with_race(
            &peer(),
            candidates,
            vec![],
            |c| async move {
                if c.address == "v6" {
                    Err(OverlayError::network_transient("unreachable"))
                } else {
                    Ok(())
                }
            },
            |_addr: String| async move { Err(OverlayError::network_transient("fail")) },
        )
        .await
        .unwrap();

        assert_eq!(result.address, "v4");
    }
}
