//! Accessibility-requirements → sub-region resolution (design spec §4.6):
//! prefer `preferred[*].segments.topology.<driver>/zone`, else
//! `…/k8s.io/zone`, else the first `requisite` entry, else empty.

use bsu_common::types::{AccessibilityRequirements, SubRegion};

const DRIVER_ZONE_KEY: &str = "topology.bsu.csi.driver/zone";
const K8S_ZONE_KEY: &str = "topology.kubernetes.io/zone";

#[must_use]
pub fn resolve_sub_region(requirements: &AccessibilityRequirements) -> SubRegion {
    for segments in &requirements.preferred {
        if let Some(zone) = segments.get(DRIVER_ZONE_KEY) {
            return SubRegion::from(zone.as_str());
        }
    }
    for segments in &requirements.preferred {
        if let Some(zone) = segments.get(K8S_ZONE_KEY) {
            return SubRegion::from(zone.as_str());
        }
    }
    for segments in &requirements.requisite {
        if let Some(zone) = segments.get(DRIVER_ZONE_KEY) {
            return SubRegion::from(zone.as_str());
        }
        if let Some(zone) = segments.get(K8S_ZONE_KEY) {
            return SubRegion::from(zone.as_str());
        }
    }
    SubRegion::from("")
}
