//! Session registry property tests
//!
//! Connecting M of N discovered devices yields exactly M live sessions and
//! N-M recorded failures, with identities 0..N-1 in discovery order no matter
//! which connections failed.

use pifleet::config::Config;
use pifleet::registry::{DeviceId, SessionRegistry};
use pifleet::transport::{DeviceBehavior, MemoryTransport};
use proptest::prelude::*;

fn connect_blocking(reachable: &[bool]) -> (SessionRegistry, Vec<String>) {
    let behaviors: Vec<(usize, DeviceBehavior)> = reachable
        .iter()
        .enumerate()
        .filter(|(_, ok)| !**ok)
        .map(|(i, _)| (i, DeviceBehavior::unreachable()))
        .collect();
    let (transport, addresses): (MemoryTransport, Vec<String>) =
        super::fixtures::fleet(reachable.len(), &behaviors);

    let mut config = Config::default();
    config.timeouts.connect_attempts = 1;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let registry = runtime.block_on(SessionRegistry::connect(&transport, &addresses, &config));
    (registry, addresses)
}

proptest! {
    #[test]
    fn prop_identities_follow_discovery_order(reachable in prop::collection::vec(any::<bool>(), 1..12)) {
        let (registry, addresses) = connect_blocking(&reachable);
        let n = reachable.len();
        let m = reachable.iter().filter(|ok| **ok).count();

        prop_assert_eq!(registry.len(), m);
        prop_assert_eq!(registry.live_count(), m);
        prop_assert_eq!(registry.connection_failures().len(), n - m);
        prop_assert_eq!(registry.all_ids(), (0..n).map(DeviceId).collect::<Vec<_>>());

        for (i, ok) in reachable.iter().enumerate() {
            let id = DeviceId(i);
            prop_assert_eq!(registry.address(id), Some(addresses[i].as_str()));
            prop_assert_eq!(registry.is_live(id), *ok);
            prop_assert_eq!(registry.connection_failures().contains_key(&id), !*ok);
        }

        prop_assert_eq!(registry.is_exhausted(), m == 0);
    }
}

#[tokio::test]
async fn test_remove_then_live_ids() {
    let (transport, addresses) = MemoryTransport::fleet(4);
    let mut config = Config::default();
    config.timeouts.connect_attempts = 1;
    let mut registry = SessionRegistry::connect(&transport, &addresses, &config).await;

    assert!(registry.remove(DeviceId(2)).await);
    assert!(!registry.remove(DeviceId(2)).await);

    assert_eq!(registry.live_ids(), vec![DeviceId(0), DeviceId(1), DeviceId(3)]);
    assert_eq!(registry.address(DeviceId(2)), None);
    assert_eq!(registry.all_ids().len(), 4);
}
