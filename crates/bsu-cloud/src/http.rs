//! `HttpCloudAdapter`: the only `CloudAdapter` implementation that talks to
//! a real cloud endpoint. Grounded on the teacher's `reqwest`-based HTTP
//! client pattern (timeout-bounded `reqwest::Client`, status-code
//! classification before the error leaves the layer).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use bsu_common::config::CloudConfig;
use bsu_common::error::{DriverError, Result};
use bsu_common::types::{
    Attachment, AttachmentState, SnapshotState, SubRegion, Tags, VmId, VmInfo, Volume,
    VolumeState, VolumeType,
};

use crate::metrics::{AdapterMetrics, ErrorClass};
use crate::{
    CloudAdapter, CreateSnapshotRequest, CreateVolumeRequest, SnapshotFilter, SnapshotPage,
    SnapshotQuery, UpdateVolumeRequest, VmFilter, VolumeFilter,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// `reqwest`-backed `CloudAdapter`.
pub struct HttpCloudAdapter {
    client: reqwest::Client,
    base_url: String,
    access_key: String,
    secret_key: String,
    metrics: AdapterMetrics,
}

impl HttpCloudAdapter {
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT);

        if let Some(proxy) = &config.https_proxy {
            let proxy = reqwest::Proxy::https(proxy)
                .map_err(|e| DriverError::Internal(format!("invalid https proxy: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(ca_bundle_path) = &config.ca_bundle_path {
            let pem = std::fs::read(ca_bundle_path).map_err(|e| {
                DriverError::Internal(format!("reading ca bundle {ca_bundle_path}: {e}"))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| DriverError::Internal(format!("parsing ca bundle: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| DriverError::Internal(format!("building http client: {e}")))?;

        let base_url = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://block.{}.cloud.internal", config.region));

        Ok(Self {
            client,
            base_url,
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            metrics: AdapterMetrics::new(),
        })
    }

    #[must_use]
    pub fn metrics(&self) -> &AdapterMetrics {
        &self.metrics
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-Access-Key", &self.access_key)
            .header("X-Secret-Key", &self.secret_key)
    }

    /// Send `builder`, classify the outcome, record it, and hand back a
    /// parsed response body on success.
    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let started = Instant::now();
        let result = builder.send().await;
        let outcome = match result {
            Ok(response) => classify_response(response).await,
            Err(e) => Err(classify_transport_error(&e)),
        };

        let class = match &outcome {
            Ok(_) => ErrorClass::Ok,
            Err((_, class)) => *class,
        };
        self.metrics.record(class, started.elapsed());

        match outcome {
            Ok(body) => serde_json::from_slice(&body)
                .map_err(|e| DriverError::Internal(format!("decoding cloud response: {e}"))),
            Err((err, _)) => Err(err),
        }
    }

    /// Like [`Self::send`] but discards the body (delete/attach/detach
    /// calls return no content on success).
    async fn send_no_content(&self, builder: reqwest::RequestBuilder) -> Result<()> {
        let started = Instant::now();
        let result = builder.send().await;
        let outcome = match result {
            Ok(response) => classify_response(response).await,
            Err(e) => Err(classify_transport_error(&e)),
        };

        let class = match &outcome {
            Ok(_) => ErrorClass::Ok,
            Err((_, class)) => *class,
        };
        self.metrics.record(class, started.elapsed());

        outcome.map(|_| ()).map_err(|(err, _)| err)
    }
}

/// Inspect a completed HTTP response and classify it into the driver error
/// taxonomy (design spec §7) and a coarse error class (§4.2), consuming the
/// body in the process. `not-found` for GET/DELETE is surfaced as an `Err`
/// here; idempotent-destroy handling happens one layer up, in the
/// Coordinator, which is the only place that knows an operation is a
/// delete.
async fn classify_response(response: reqwest::Response) -> std::result::Result<bytes::Bytes, (DriverError, ErrorClass)> {
    let status = response.status();
    if status.is_success() {
        let body = response
            .bytes()
            .await
            .map_err(|e| (DriverError::Unavailable(e.to_string()), ErrorClass::Network))?;
        return Ok(body);
    }

    let body_text = response.text().await.unwrap_or_default();
    let (err, class) = match status.as_u16() {
        400 | 422 => (DriverError::InvalidArgument(body_text), ErrorClass::Conflict),
        404 => (DriverError::NotFound(body_text), ErrorClass::NotFound),
        409 => (DriverError::AlreadyExists(body_text), ErrorClass::Conflict),
        403 | 402 => (
            DriverError::ResourceExhausted(body_text),
            ErrorClass::Conflict,
        ),
        429 => (DriverError::Unavailable(body_text), ErrorClass::Throttled),
        500..=599 => (
            DriverError::Unavailable(format!("cloud server error {status}: {body_text}")),
            ErrorClass::ServerError,
        ),
        _ => (
            DriverError::Internal(format!("unexpected cloud status {status}: {body_text}")),
            ErrorClass::ServerError,
        ),
    };
    Err((err, class))
}

fn classify_transport_error(e: &reqwest::Error) -> (DriverError, ErrorClass) {
    if e.is_timeout() {
        (
            DriverError::Unavailable(format!("cloud request timed out: {e}")),
            ErrorClass::Network,
        )
    } else {
        (
            DriverError::Unavailable(format!("cloud request failed: {e}")),
            ErrorClass::Network,
        )
    }
}

#[derive(Serialize)]
struct CreateVolumeBody<'a> {
    capacity_gib: u64,
    #[serde(rename = "type")]
    volume_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    iops_per_gib: Option<u32>,
    sub_region: &'a str,
    encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    kms_key_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snapshot_source: Option<&'a str>,
    tags: &'a Tags,
}

#[derive(Deserialize)]
struct VolumeDto {
    id: String,
    name: String,
    capacity_gib: u64,
    #[serde(rename = "type")]
    volume_type: String,
    iops_per_gib: Option<u32>,
    sub_region: String,
    snapshot_source: Option<String>,
    state: String,
    attachment: Option<AttachmentDto>,
    tags: Tags,
}

#[derive(Deserialize)]
struct AttachmentDto {
    vm_id: String,
    device_path: String,
    state: String,
}

impl From<VolumeDto> for Volume {
    fn from(dto: VolumeDto) -> Self {
        Self {
            id: dto.id.clone(),
            name: dto.name,
            capacity_gib: dto.capacity_gib,
            volume_type: VolumeType::parse(&dto.volume_type).unwrap_or_default(),
            iops_per_gib: dto.iops_per_gib,
            sub_region: SubRegion::from(dto.sub_region),
            snapshot_source: dto.snapshot_source,
            state: parse_volume_state(&dto.state),
            attachment: dto.attachment.map(|a| Attachment {
                volume_id: dto.id,
                vm_id: VmId::from(a.vm_id),
                device_path: a.device_path,
                state: parse_attachment_state(&a.state),
            }),
            tags: dto.tags,
        }
    }
}

fn parse_volume_state(s: &str) -> VolumeState {
    match s {
        "creating" => VolumeState::Creating,
        "available" => VolumeState::Available,
        "in-use" => VolumeState::InUse,
        "deleting" => VolumeState::Deleting,
        "optimizing" => VolumeState::Optimizing,
        _ => VolumeState::Error,
    }
}

fn parse_attachment_state(s: &str) -> AttachmentState {
    match s {
        "attaching" => AttachmentState::Attaching,
        "attached" => AttachmentState::Attached,
        "detaching" => AttachmentState::Detaching,
        _ => AttachmentState::Detached,
    }
}

#[derive(Deserialize)]
struct VolumeListDto {
    items: Vec<VolumeDto>,
}

#[derive(Serialize)]
struct CreateSnapshotBody<'a> {
    source_volume_id: &'a str,
    tags: &'a Tags,
}

#[derive(Deserialize)]
struct SnapshotDto {
    id: String,
    source_volume_id: String,
    size_bytes: u64,
    creation_time: chrono::DateTime<chrono::Utc>,
    state: String,
    tags: Tags,
}

impl From<SnapshotDto> for bsu_common::types::Snapshot {
    fn from(dto: SnapshotDto) -> Self {
        Self {
            id: dto.id,
            source_volume_id: dto.source_volume_id,
            size_bytes: dto.size_bytes,
            creation_time: dto.creation_time,
            state: parse_snapshot_state(&dto.state),
            tags: dto.tags,
        }
    }
}

fn parse_snapshot_state(s: &str) -> SnapshotState {
    match s {
        "pending" => SnapshotState::Pending,
        "completed" => SnapshotState::Completed,
        "deleting" => SnapshotState::Deleting,
        _ => SnapshotState::Error,
    }
}

#[derive(Deserialize)]
struct SnapshotPageDto {
    items: Vec<SnapshotDto>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct VmDto {
    id: String,
    sub_region: String,
}

#[derive(Deserialize)]
struct VmListDto {
    items: Vec<VmDto>,
}

#[async_trait]
impl CloudAdapter for HttpCloudAdapter {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume> {
        let body = CreateVolumeBody {
            capacity_gib: request.capacity_gib,
            volume_type: request.volume_type.as_str(),
            iops_per_gib: request.iops_per_gib,
            sub_region: request.sub_region.as_str(),
            encrypted: request.encrypted,
            kms_key_id: request.kms_key_id.as_deref(),
            snapshot_source: request.snapshot_source.as_deref(),
            tags: &request.tags,
        };
        let builder = self.request(reqwest::Method::POST, "/volumes").json(&body);
        self.send::<VolumeDto>(builder).await.map(Into::into)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let builder = self.request(reqwest::Method::DELETE, &format!("/volumes/{volume_id}"));
        self.send_no_content(builder).await
    }

    async fn read_volumes(&self, filter: VolumeFilter) -> Result<Vec<Volume>> {
        let mut builder = self.request(reqwest::Method::GET, "/volumes");
        if let Some(id) = &filter.id {
            builder = builder.query(&[("id", id)]);
        }
        if let Some(name_tag) = &filter.name_tag {
            builder = builder.query(&[("name_tag", name_tag)]);
        }
        if let Some(sub_region) = &filter.sub_region {
            builder = builder.query(&[("sub_region", sub_region.as_str())]);
        }
        let dto: VolumeListDto = self.send(builder).await?;
        Ok(dto.items.into_iter().map(Into::into).collect())
    }

    async fn update_volume(&self, request: UpdateVolumeRequest) -> Result<Volume> {
        #[derive(Serialize)]
        struct Body {
            #[serde(skip_serializing_if = "Option::is_none")]
            capacity_gib: Option<u64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            iops_per_gib: Option<u32>,
            #[serde(skip_serializing_if = "Option::is_none", rename = "type")]
            volume_type: Option<&'static str>,
        }
        let builder = self
            .request(
                reqwest::Method::PATCH,
                &format!("/volumes/{}", request.volume_id),
            )
            .json(&Body {
                capacity_gib: request.capacity_gib,
                iops_per_gib: request.iops_per_gib,
                volume_type: request.volume_type.map(VolumeType::as_str),
            });
        self.send::<VolumeDto>(builder).await.map(Into::into)
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &VmId, device: &str) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            vm_id: &'a str,
            device: &'a str,
        }
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/volumes/{volume_id}/attach"),
            )
            .json(&Body {
                vm_id: vm_id.as_str(),
                device,
            });
        self.send_no_content(builder).await
    }

    async fn detach_volume(&self, volume_id: &str, vm_id: &VmId) -> Result<()> {
        #[derive(Serialize)]
        struct Body<'a> {
            vm_id: &'a str,
        }
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/volumes/{volume_id}/detach"),
            )
            .json(&Body { vm_id: vm_id.as_str() });
        self.send_no_content(builder).await
    }

    async fn create_snapshot(
        &self,
        request: CreateSnapshotRequest,
    ) -> Result<bsu_common::types::Snapshot> {
        let body = CreateSnapshotBody {
            source_volume_id: &request.source_volume_id,
            tags: &request.tags,
        };
        let builder = self
            .request(reqwest::Method::POST, "/snapshots")
            .json(&body);
        self.send::<SnapshotDto>(builder).await.map(Into::into)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let builder = self.request(
            reqwest::Method::DELETE,
            &format!("/snapshots/{snapshot_id}"),
        );
        self.send_no_content(builder).await
    }

    async fn read_snapshots_page(&self, query: SnapshotQuery) -> Result<SnapshotPage> {
        let mut builder = self.request(reqwest::Method::GET, "/snapshots");
        if let Some(id) = &query.filter.id {
            builder = builder.query(&[("id", id)]);
        }
        if let Some(name_tag) = &query.filter.name_tag {
            builder = builder.query(&[("name_tag", name_tag)]);
        }
        if let Some(source_volume_id) = &query.filter.source_volume_id {
            builder = builder.query(&[("source_volume_id", source_volume_id)]);
        }
        if let Some(max_entries) = query.max_entries {
            builder = builder.query(&[("max_entries", max_entries)]);
        }
        if let Some(page_token) = &query.page_token {
            builder = builder.query(&[("page_token", page_token)]);
        }
        let dto: SnapshotPageDto = self.send(builder).await?;
        Ok(SnapshotPage {
            items: dto.items.into_iter().map(Into::into).collect(),
            next_page_token: dto.next_page_token,
        })
    }

    async fn read_vms(&self, filter: VmFilter) -> Result<Vec<VmInfo>> {
        let mut builder = self.request(reqwest::Method::GET, "/vms");
        if let Some(vm_id) = &filter.vm_id {
            builder = builder.query(&[("vm_id", vm_id.as_str())]);
        }
        let dto: VmListDto = self.send(builder).await?;
        Ok(dto
            .items
            .into_iter()
            .map(|vm| VmInfo {
                id: VmId::from(vm.id),
                sub_region: SubRegion::from(vm.sub_region),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_volume_states() {
        assert_eq!(parse_volume_state("available"), VolumeState::Available);
        assert_eq!(parse_volume_state("weird"), VolumeState::Error);
    }

    #[test]
    fn parses_snapshot_states() {
        assert_eq!(parse_snapshot_state("completed"), SnapshotState::Completed);
        assert_eq!(parse_snapshot_state("bogus"), SnapshotState::Error);
    }
}
