//! Shared test utilities for CSI driver tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::controller::ControllerService;
use crate::csi;
use crate::driver::{Config, DRIVER_NAME, DRIVER_VERSION, MountManager, Provisioner};
use crate::engine::{
    Engine, EngineError, IpAddress, LifecycleState, NewVolume, ResourceRef,
    StorageServerInterface, Volume,
};
use crate::identity::IdentityService;
use crate::mounter::Mounter;
use crate::node::NodeService;
use crate::types::Components;

pub fn mount_capability() -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::SingleNodeMultiWriter as i32,
        }),
    }
}

pub fn block_capability() -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: csi::volume_capability::access_mode::Mode::SingleNodeWriter as i32,
        }),
    }
}

fn http_error(status: u16, message: impl Into<String>) -> EngineError {
    EngineError::Http {
        status,
        message: message.into(),
    }
}

struct FakeVolume {
    volume: Volume,
    pending_polls: u32,
    gets: u32,
}

#[derive(Default)]
struct FakeEngineState {
    /// Keyed by creation order.
    volumes: BTreeMap<u64, FakeVolume>,
    next_seq: u64,
    storage_servers: HashMap<String, StorageServerInterface>,
    failures: HashMap<&'static str, u16>,
    volume_path: Option<String>,
}

impl FakeEngineState {
    fn find_mut(&mut self, identifier: &str) -> Option<(u64, &mut FakeVolume)> {
        self.volumes
            .iter_mut()
            .find(|(_, v)| v.volume.identifier == identifier)
            .map(|(seq, v)| (*seq, v))
    }

    /// Whether a volume created before `seq` holds `name`.
    fn name_taken_before(&self, name: &str, seq: u64) -> bool {
        self.volumes.range(..seq).any(|(_, v)| {
            v.volume.name == name && v.volume.state != LifecycleState::Error
        })
    }

    fn insert(&mut self, volume: Volume, pending_polls: u32) -> Volume {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.volumes.insert(
            seq,
            FakeVolume {
                volume: volume.clone(),
                pending_polls,
                gets: 0,
            },
        );
        volume
    }
}

/// In-memory engine.
///
/// New volumes stay pending for a configurable number of polls. When one
/// resolves while an older volume with the same name exists, it fails with
/// the engine's "not unique" error, the way the real engine reports a lost
/// creation race.
pub struct FakeEngine {
    state: Mutex<FakeEngineState>,
    pending_polls: u32,
    reject_taken_names: bool,
    provisioning_error: Option<String>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeEngineState::default()),
            pending_polls: 0,
            reject_taken_names: false,
            provisioning_error: None,
        }
    }

    /// Polls a new volume answers with `Pending` before it resolves.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Refuse creates of taken names with HTTP 422 instead of racing.
    pub fn with_taken_names_rejected(mut self) -> Self {
        self.reject_taken_names = true;
        self
    }

    /// Fail every new volume with `message` once it resolves.
    pub fn with_provisioning_error(mut self, message: &str) -> Self {
        self.provisioning_error = Some(message.to_string());
        self
    }

    pub fn with_volume_path(self, path: &str) -> Self {
        self.set_volume_path(path);
        self
    }

    pub fn with_storage_server(self, identifier: &str, network_name: Option<&str>) -> Self {
        let ssi = StorageServerInterface {
            identifier: identifier.to_string(),
            name: format!("nfs-{identifier}"),
            ip_address: network_name.map(|name| IpAddress {
                identifier: format!("ip-{identifier}"),
                name: name.to_string(),
            }),
            state: LifecycleState::Ready,
            ..Default::default()
        };
        self.state
            .lock()
            .unwrap()
            .storage_servers
            .insert(identifier.to_string(), ssi);
        self
    }

    /// Export path assigned to volumes when they become ready.
    pub fn set_volume_path(&self, path: &str) {
        self.state.lock().unwrap().volume_path = Some(path.to_string());
    }

    /// Make the next call of `operation` fail with HTTP `status`.
    pub fn fail_operation(&self, operation: &'static str, status: u16) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(operation, status);
    }

    pub fn insert_ready(&self, name: &str, size_bytes: i64) -> Volume {
        let identifier = new_identifier();
        let volume = Volume {
            path: format!("/exports/{identifier}"),
            identifier,
            name: name.to_string(),
            size_bytes,
            state: LifecycleState::Ready,
            ..Default::default()
        };
        self.state.lock().unwrap().insert(volume, 0)
    }

    pub fn insert_pending(&self, name: &str, size_bytes: i64) -> Volume {
        let volume = Volume {
            identifier: new_identifier(),
            name: name.to_string(),
            size_bytes,
            state: LifecycleState::Pending,
            ..Default::default()
        };
        self.state.lock().unwrap().insert(volume, self.pending_polls)
    }

    pub fn volume(&self, identifier: &str) -> Option<Volume> {
        self.state
            .lock()
            .unwrap()
            .find_mut(identifier)
            .map(|(_, v)| v.volume.clone())
    }

    /// Volumes with `name` in any state.
    pub fn volumes_named(&self, name: &str) -> Vec<Volume> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .values()
            .filter(|v| v.volume.name == name)
            .map(|v| v.volume.clone())
            .collect()
    }

    /// Volumes with `name` that are not in the error state.
    pub fn live_volumes_named(&self, name: &str) -> Vec<Volume> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .values()
            .filter(|v| v.volume.name == name && v.volume.state != LifecycleState::Error)
            .map(|v| v.volume.clone())
            .collect()
    }

    /// Number of `get_volume` calls seen for `identifier`.
    pub fn get_count(&self, identifier: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .find_mut(identifier)
            .map_or(0, |(_, v)| v.gets)
    }

    fn check_failure(&self, operation: &'static str) -> Result<(), EngineError> {
        match self.state.lock().unwrap().failures.remove(operation) {
            Some(status) => Err(http_error(status, format!("injected {operation} failure"))),
            None => Ok(()),
        }
    }
}

fn new_identifier() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[async_trait]
impl Engine for FakeEngine {
    async fn create_volume(&self, request: &NewVolume) -> Result<Volume, EngineError> {
        self.check_failure("create_volume")?;
        let mut state = self.state.lock().unwrap();

        if self.reject_taken_names && state.name_taken_before(&request.name, u64::MAX) {
            return Err(http_error(422, "name is already taken"));
        }

        let volume = Volume {
            identifier: new_identifier(),
            name: request.name.clone(),
            size_bytes: request.size_bytes,
            storage_class: request.storage_class.clone(),
            storage_server_interfaces: Some(vec![ResourceRef {
                identifier: request.storage_server_ref.clone(),
                name: String::new(),
            }]),
            state: LifecycleState::Pending,
            ..Default::default()
        };
        Ok(state.insert(volume, self.pending_polls))
    }

    async fn get_volume(&self, identifier: &str) -> Result<Volume, EngineError> {
        self.check_failure("get_volume")?;
        let mut state = self.state.lock().unwrap();
        let volume_path = state.volume_path.clone();

        let (seq, name) = match state.find_mut(identifier) {
            Some((seq, fake)) => {
                fake.gets += 1;
                if fake.volume.state != LifecycleState::Pending {
                    return Ok(fake.volume.clone());
                }
                if fake.pending_polls > 0 {
                    fake.pending_polls -= 1;
                    return Ok(fake.volume.clone());
                }
                (seq, fake.volume.name.clone())
            }
            None => return Err(http_error(404, format!("volume {identifier} not found"))),
        };

        let lost_race = state.name_taken_before(&name, seq);
        let Some((_, fake)) = state.find_mut(identifier) else {
            return Err(http_error(404, format!("volume {identifier} not found")));
        };
        if lost_race {
            fake.volume.state = LifecycleState::Error;
            fake.volume.error = format!("Volume name {name} is not unique");
        } else if let Some(message) = &self.provisioning_error {
            fake.volume.state = LifecycleState::Error;
            fake.volume.error = message.clone();
        } else {
            fake.volume.state = LifecycleState::Ready;
            fake.volume.path =
                volume_path.unwrap_or_else(|| format!("/exports/{}", fake.volume.identifier));
        }
        Ok(fake.volume.clone())
    }

    async fn update_volume_size(
        &self,
        identifier: &str,
        size_bytes: i64,
    ) -> Result<(), EngineError> {
        self.check_failure("update_volume_size")?;
        match self.state.lock().unwrap().find_mut(identifier) {
            Some((_, fake)) => {
                fake.volume.size_bytes = size_bytes;
                Ok(())
            }
            None => Err(http_error(404, format!("volume {identifier} not found"))),
        }
    }

    async fn destroy_volume(&self, identifier: &str) -> Result<(), EngineError> {
        self.check_failure("destroy_volume")?;
        let mut state = self.state.lock().unwrap();
        match state.find_mut(identifier).map(|(seq, _)| seq) {
            Some(seq) => {
                state.volumes.remove(&seq);
                Ok(())
            }
            None => Err(http_error(404, format!("volume {identifier} not found"))),
        }
    }

    async fn list_volumes_by_name(&self, name: &str) -> Result<Vec<Volume>, EngineError> {
        self.check_failure("list_volumes_by_name")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .volumes
            .values()
            .filter(|v| v.volume.name == name)
            .map(|v| Volume {
                identifier: v.volume.identifier.clone(),
                name: v.volume.name.clone(),
                ..Default::default()
            })
            .collect())
    }

    async fn get_storage_server_interface(
        &self,
        identifier: &str,
    ) -> Result<StorageServerInterface, EngineError> {
        self.check_failure("get_storage_server_interface")?;
        self.state
            .lock()
            .unwrap()
            .storage_servers
            .get(identifier)
            .cloned()
            .ok_or_else(|| http_error(404, format!("storage server {identifier} not found")))
    }
}

/// A mount recorded by [`FakeMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeMount {
    pub source: String,
    pub fs_type: String,
    pub options: Vec<String>,
}

#[derive(Default)]
struct FakeMounterState {
    mounts: HashMap<PathBuf, FakeMount>,
    mount_calls: u32,
    probe_failure: Option<io::ErrorKind>,
    mount_failure: Option<String>,
    unmount_failure: Option<String>,
    eager_unmount_failure: Option<String>,
    corrupted: HashSet<PathBuf>,
    /// `lazy` flag of every unmount call, in order.
    unmounts: Vec<bool>,
}

/// In-memory mount table. Target directories are real so tests can check
/// that they get created and removed.
#[derive(Default)]
pub struct FakeMounter {
    state: Mutex<FakeMounterState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_at(&self, target: &Path) -> Option<FakeMount> {
        self.state.lock().unwrap().mounts.get(target).cloned()
    }

    pub fn mount_calls(&self) -> u32 {
        self.state.lock().unwrap().mount_calls
    }

    pub fn fail_probe(&self, kind: io::ErrorKind) {
        self.state.lock().unwrap().probe_failure = Some(kind);
    }

    pub fn fail_mount(&self, message: &str) {
        self.state.lock().unwrap().mount_failure = Some(message.to_string());
    }

    pub fn fail_unmount(&self, message: &str) {
        self.state.lock().unwrap().unmount_failure = Some(message.to_string());
    }

    /// Fail unmounts that are not lazy.
    pub fn fail_eager_unmount(&self, message: &str) {
        self.state.lock().unwrap().eager_unmount_failure = Some(message.to_string());
    }

    /// Make probes of `target` fail with a stale file handle, as they do
    /// once the NFS server behind a mount goes away.
    pub fn corrupt_mount(&self, target: &Path) {
        self.state
            .lock()
            .unwrap()
            .corrupted
            .insert(target.to_path_buf());
    }

    pub fn unmounts(&self) -> Vec<bool> {
        self.state.lock().unwrap().unmounts.clone()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn is_likely_not_mount_point(&self, target: &Path) -> io::Result<bool> {
        let state = self.state.lock().unwrap();
        if let Some(kind) = state.probe_failure {
            return Err(io::Error::new(kind, "injected probe failure"));
        }
        if state.corrupted.contains(target) {
            // ESTALE
            return Err(io::Error::from_raw_os_error(116));
        }
        if state.mounts.contains_key(target) {
            return Ok(false);
        }
        if !target.exists() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such directory"));
        }
        Ok(true)
    }

    async fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mount_calls += 1;
        if let Some(message) = &state.mount_failure {
            return Err(io::Error::other(message.clone()));
        }
        state.mounts.insert(
            target.to_path_buf(),
            FakeMount {
                source: source.to_string(),
                fs_type: fs_type.to_string(),
                options: options.to_vec(),
            },
        );
        Ok(())
    }

    async fn unmount(&self, target: &Path, lazy: bool) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.unmounts.push(lazy);
        let failure = match lazy {
            true => state.unmount_failure.clone(),
            false => state
                .unmount_failure
                .clone()
                .or_else(|| state.eager_unmount_failure.clone()),
        };
        if let Some(message) = failure {
            return Err(io::Error::other(message));
        }
        state.mounts.remove(target);
        state.corrupted.remove(target);
        Ok(())
    }
}

/// Test fixture wiring services to a [`FakeEngine`] and a [`FakeMounter`].
pub struct TestFixture {
    pub config: Config,
    pub engine: Arc<FakeEngine>,
    pub mounter: Arc<FakeMounter>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_components(Components::all())
    }

    pub fn with_components(components: Components) -> Self {
        let config = Config {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            node_id: "test-node".to_string(),
            endpoint: "unix:///tmp/test.sock".to_string(),
            components,
            create_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let engine = Arc::new(
            FakeEngine::new()
                .with_pending_polls(1)
                .with_storage_server("srv-1", Some("storage.example")),
        );
        Self {
            config,
            engine,
            mounter: Arc::new(FakeMounter::new()),
        }
    }

    pub fn identity_service(&self) -> IdentityService {
        IdentityService::new(&self.config.name, &self.config.version, self.config.components)
    }

    pub fn controller_service(&self) -> ControllerService {
        let engine: Arc<dyn Engine> = self.engine.clone();
        ControllerService::new(
            Provisioner::new(engine, self.config.poll_interval),
            self.config.create_timeout,
        )
    }

    pub fn node_service(&self) -> NodeService {
        let mounter: Arc<dyn Mounter> = self.mounter.clone();
        NodeService::new(self.config.node_id.clone(), MountManager::new(mounter))
    }
}

