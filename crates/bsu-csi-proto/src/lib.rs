//! CSI protocol definitions for the bsu-csi-driver.

/// Identity/Controller/Node service definitions (design spec §4.6, §4.7).
pub mod csi {
    tonic::include_proto!("bsu.csi.v1");
}
