mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use bsu_backoff::BackoffPolicy;
use bsu_common::error::DriverError;
use bsu_node_block::{
    ExpandVolumeParams, LuksFormatOptions, NodeBlockLayer, PublishVolumeParams, StageVolumeParams,
    UnstageVolumeParams,
};

use support::mock_crypto::MockCrypto;
use support::mock_mounter::MockMounter;

fn test_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), 1.5, 10)
}

fn stage_params(device: &str, staging: &str) -> StageVolumeParams {
    StageVolumeParams {
        volume_id: "vol-1".to_string(),
        published_device_path: device.to_string(),
        staging_path: staging.to_string(),
        fstype: None,
        mount_options: vec!["noatime".to_string()],
        encrypted: false,
        passphrase: None,
        luks_format_options: LuksFormatOptions::default(),
        luks_open_flags: Vec::new(),
    }
}

#[tokio::test]
async fn stage_formats_an_unformatted_device_then_mounts() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto, test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    layer
        .stage_volume(stage_params("/dev/xvdb", "/mnt/stage/vol-1"), &cancel)
        .await
        .unwrap();

    assert_eq!(mounter.mkfs_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mounter.mount_calls.load(Ordering::SeqCst), 1);
    assert!(mounter.is_mounted_at("/mnt/stage/vol-1"));
}

#[tokio::test]
async fn restaging_with_same_options_is_a_noop() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto, test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    layer
        .stage_volume(stage_params("/dev/xvdb", "/mnt/stage/vol-1"), &cancel)
        .await
        .unwrap();
    layer
        .stage_volume(stage_params("/dev/xvdb", "/mnt/stage/vol-1"), &cancel)
        .await
        .unwrap();

    assert_eq!(mounter.mount_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restaging_with_different_options_fails_precondition() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto, test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    layer
        .stage_volume(stage_params("/dev/xvdb", "/mnt/stage/vol-1"), &cancel)
        .await
        .unwrap();

    let mut other = stage_params("/dev/xvdb", "/mnt/stage/vol-1");
    other.mount_options = vec!["ro".to_string()];
    let err = layer.stage_volume(other, &cancel).await.unwrap_err();
    assert!(matches!(err, DriverError::FailedPrecondition(_)));
}

#[tokio::test]
async fn device_resolution_retries_until_kernel_catches_up() {
    let mounter = Arc::new(MockMounter::with_resolve_after(3));
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto, test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    layer
        .stage_volume(stage_params("/dev/xvdb", "/mnt/stage/vol-1"), &cancel)
        .await
        .unwrap();

    assert!(mounter.resolve_calls.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn encrypted_stage_formats_and_opens_once() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto.clone(), test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    let mut params = stage_params("/dev/xvdb", "/mnt/stage/vol-1");
    params.encrypted = true;
    params.passphrase = Some("hunter2".to_string());

    layer.stage_volume(params.clone(), &cancel).await.unwrap();
    assert_eq!(crypto.format_calls.load(Ordering::SeqCst), 1);
    assert_eq!(crypto.open_calls.load(Ordering::SeqCst), 1);

    // Re-staging with the mapping already open must not re-format/re-open.
    let mut restage = params;
    restage.staging_path = "/mnt/stage/vol-1b".to_string();
    layer.stage_volume(restage, &cancel).await.unwrap();
    assert_eq!(crypto.format_calls.load(Ordering::SeqCst), 1);
    assert_eq!(crypto.open_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn encrypted_stage_without_passphrase_is_rejected() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter, crypto, test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    let mut params = stage_params("/dev/xvdb", "/mnt/stage/vol-1");
    params.encrypted = true;

    let err = layer.stage_volume(params, &cancel).await.unwrap_err();
    assert!(matches!(err, DriverError::InvalidArgument(_)));
}

#[tokio::test]
async fn unstage_is_idempotent_and_closes_the_mapping() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto.clone(), test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    let mut params = stage_params("/dev/xvdb", "/mnt/stage/vol-1");
    params.encrypted = true;
    params.passphrase = Some("hunter2".to_string());
    layer.stage_volume(params, &cancel).await.unwrap();

    layer
        .unstage_volume(UnstageVolumeParams {
            volume_id: "vol-1".to_string(),
            staging_path: "/mnt/stage/vol-1".to_string(),
            encrypted: true,
        })
        .await
        .unwrap();
    assert_eq!(crypto.close_calls.load(Ordering::SeqCst), 1);
    assert!(!mounter.is_mounted_at("/mnt/stage/vol-1"));

    // Unstaging again (already unmounted, mapping already closed) is still Ok.
    layer
        .unstage_volume(UnstageVolumeParams {
            volume_id: "vol-1".to_string(),
            staging_path: "/mnt/stage/vol-1".to_string(),
            encrypted: true,
        })
        .await
        .unwrap();
    assert_eq!(crypto.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn publish_bind_mounts_from_staging_path() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto, test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    layer
        .stage_volume(stage_params("/dev/xvdb", "/mnt/stage/vol-1"), &cancel)
        .await
        .unwrap();

    layer
        .publish_volume(PublishVolumeParams {
            staging_path: "/mnt/stage/vol-1".to_string(),
            publish_path: "/mnt/publish/vol-1".to_string(),
            read_only: true,
            block_mode: false,
            mount_options: vec![],
        })
        .await
        .unwrap();

    assert!(mounter.is_mounted_at("/mnt/publish/vol-1"));

    // Publishing again against an already-mounted publish path is a no-op.
    layer
        .publish_volume(PublishVolumeParams {
            staging_path: "/mnt/stage/vol-1".to_string(),
            publish_path: "/mnt/publish/vol-1".to_string(),
            read_only: true,
            block_mode: false,
            mount_options: vec![],
        })
        .await
        .unwrap();
    assert_eq!(mounter.mount_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expand_resizes_the_luks_mapping_then_the_filesystem() {
    let mounter = Arc::new(MockMounter::new());
    mounter.mark_formatted("/dev/mapper/bsu-vol-1", "ext4");
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter.clone(), crypto.clone(), test_backoff(), "ext4");
    let cancel = CancellationToken::new();

    layer
        .expand_volume(
            ExpandVolumeParams {
                volume_id: "vol-1".to_string(),
                staging_path: "/mnt/stage/vol-1".to_string(),
                published_device_path: "/dev/xvdb".to_string(),
                encrypted: true,
                fstype: None,
            },
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(crypto.resize_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mounter.resize_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn volume_stats_reports_fs_usage() {
    let mounter = Arc::new(MockMounter::new());
    let crypto = Arc::new(MockCrypto::new());
    let layer = NodeBlockLayer::new(mounter, crypto, test_backoff(), "ext4");

    let stats = layer.volume_stats("/mnt/stage/vol-1").await.unwrap();
    assert_eq!(stats.capacity_bytes, 1024);
    assert_eq!(stats.used_inodes, 10);
}
