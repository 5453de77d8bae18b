//! TrafficSplit -> VirtualService translation.

use kube::ResourceExt;

use crate::ownership;
use crate::resources::{
    Destination, HttpRoute, HttpRouteDestination, TrafficSplit, VirtualService, VirtualServiceSpec,
};

/// Build the VirtualService that `split` should converge to.
///
/// Pure and deterministic: backends map one-to-one to route destinations in
/// input order (duplicates included), and the only metadata written is the
/// derived name, the owner's namespace, the ownership label and, once the
/// owner has a uid, its controller reference. An empty backend list yields a
/// single route with no destinations.
pub fn build_virtual_service(split: &TrafficSplit) -> VirtualService {
    let owner = split.name_any();
    let route = split
        .spec
        .backends
        .iter()
        .map(|b| HttpRouteDestination { destination: Destination { host: b.service.clone() }, weight: b.weight })
        .collect();
    let hosts = if split.spec.service.is_empty() { Vec::new() } else { vec![split.spec.service.clone()] };

    let mut vs = VirtualService::new(
        &ownership::derived_name(&owner),
        VirtualServiceSpec { hosts, http: vec![HttpRoute { route }] },
    );
    vs.metadata.namespace = split.namespace();
    vs.metadata.labels = Some(ownership::owner_labels(&owner));
    vs.metadata.owner_references = ownership::owner_reference(split).map(|r| vec![r]);
    vs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TrafficSplitBackend, TrafficSplitSpec};

    fn split(name: &str, backends: &[(&str, u32)]) -> TrafficSplit {
        let mut ts = TrafficSplit::new(
            name,
            TrafficSplitSpec {
                service: "web".into(),
                backends: backends
                    .iter()
                    .map(|(s, w)| TrafficSplitBackend { service: (*s).to_string(), weight: *w })
                    .collect(),
            },
        );
        ts.metadata.namespace = Some("default".into());
        ts.metadata.uid = Some("5f0c4a1e-0000-0000-0000-000000000001".into());
        ts
    }

    #[test]
    fn empty_backends_build_an_empty_route() {
        let mut ts = TrafficSplit::new("traffic-split-name", TrafficSplitSpec::default());
        ts.metadata.namespace = Some("default".into());
        let vs = build_virtual_service(&ts);
        assert_eq!(vs.metadata.name.as_deref(), Some("traffic-split-name-vs"));
        assert_eq!(vs.metadata.namespace.as_deref(), Some("default"));
        assert!(vs.weighted_destinations().is_empty());
        assert!(vs.spec.hosts.is_empty());
        assert_eq!(vs.labels().get(ownership::OWNER_LABEL).map(String::as_str), Some("traffic-split-name"));
        assert!(vs.metadata.owner_references.is_none());
    }

    #[test]
    fn backends_map_in_order_with_duplicates() {
        let vs = build_virtual_service(&split("web", &[("web-v2", 10), ("web-v1", 90), ("web-v2", 5)]));
        let got: Vec<_> = vs.weighted_destinations().into_iter().map(|d| (d.host, d.weight)).collect();
        assert_eq!(
            got,
            vec![("web-v2".to_string(), 10), ("web-v1".to_string(), 90), ("web-v2".to_string(), 5)]
        );
        assert_eq!(vs.spec.hosts, vec!["web".to_string()]);
        assert_eq!(vs.spec.http.len(), 1);
    }

    #[test]
    fn stamps_controller_owner_reference() {
        let vs = build_virtual_service(&split("web", &[("a", 1)]));
        let refs = vs.metadata.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].uid, "5f0c4a1e-0000-0000-0000-000000000001");
        assert_eq!(refs[0].controller, Some(true));
        assert_eq!(refs[0].block_owner_deletion, Some(true));
    }

    #[test]
    fn build_is_byte_for_byte_deterministic() {
        let ts = split("web", &[("a", 50), ("b", 50)]);
        let first = serde_json::to_vec(&build_virtual_service(&ts)).unwrap();
        let second = serde_json::to_vec(&build_virtual_service(&ts.clone())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn built_spec_survives_a_json_round_trip() {
        for backends in [&[][..], &[("a", 0)][..], &[("a", 90), ("b", 10)][..]] {
            let vs = build_virtual_service(&split("web", backends));
            let back: VirtualService = serde_json::from_slice(&serde_json::to_vec(&vs).unwrap()).unwrap();
            assert_eq!(back.spec, vs.spec);
        }
    }
}
