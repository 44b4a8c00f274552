//! In-memory storage driver.
//!
//! Keeps every dataset in a map guarded by one mutex. The mutex is never held
//! across an `.await`: stream bytes are read and written outside of it and
//! the map is only touched to validate and to commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::dataset::{
    parent_name, snapshot_full_name, split_snapshot_name, validate_name, Dataset, DatasetType,
};
use crate::driver::{
    DestroyFlags, ListOptions, ReceiveOptions, SendOptions, StorageDriver, StreamReader,
    StreamWriter, PROPERTY_CREATION, PROPERTY_GUID, PROPERTY_RECEIVE_RESUME_TOKEN,
};
use crate::error::{DriverError, DriverResult};
use crate::stream::{self, ResumeToken, StreamHeader};

const READ_ONLY_PROPS: &[&str] = &[
    PROPERTY_CREATION,
    PROPERTY_GUID,
    PROPERTY_RECEIVE_RESUME_TOKEN,
    "createtxg",
];

#[derive(Debug, Clone)]
struct PartialReceive {
    header: StreamHeader,
    received: Vec<u8>,
    properties: HashMap<String, String>,
}

impl PartialReceive {
    fn token(&self) -> String {
        ResumeToken {
            source: self.header.source.clone(),
            guid: self.header.guid,
            base_guid: self.header.base_guid,
            offset: self.received.len() as u64,
            total: self.header.total,
        }
        .encode()
    }
}

#[derive(Debug, Clone)]
struct Node {
    dataset_type: DatasetType,
    content: Vec<u8>,
    guid: u64,
    created: DateTime<Utc>,
    createtxg: u64,
    props: BTreeMap<String, String>,
    partial: Option<PartialReceive>,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, Node>,
    next_txg: u64,
}

impl State {
    fn node(&self, name: &str) -> DriverResult<&Node> {
        self.datasets
            .get(name)
            .ok_or_else(|| DriverError::not_found(name))
    }

    fn insert(&mut self, name: &str, dataset_type: DatasetType, content: Vec<u8>, guid: u64) {
        self.next_txg += 1;
        self.datasets.insert(
            name.to_string(),
            Node {
                dataset_type,
                content,
                guid,
                created: Utc::now(),
                createtxg: self.next_txg,
                props: BTreeMap::new(),
                partial: None,
            },
        );
    }

    /// Effective value of a property: local, else inherited from the
    /// snapshot's filesystem and then from ancestors.
    fn resolve(&self, name: &str, key: &str) -> Option<String> {
        let node = self.datasets.get(name)?;
        match key {
            PROPERTY_CREATION => return Some(node.created.timestamp().to_string()),
            PROPERTY_GUID => return Some(node.guid.to_string()),
            "createtxg" => return Some(node.createtxg.to_string()),
            PROPERTY_RECEIVE_RESUME_TOKEN => return node.partial.as_ref().map(|p| p.token()),
            _ => {}
        }
        let mut current = Some(name.to_string());
        while let Some(ds) = current {
            if let Some(value) = self.datasets.get(&ds).and_then(|n| n.props.get(key)) {
                return Some(value.clone());
            }
            current = match split_snapshot_name(&ds) {
                Some((fs, _)) => Some(fs.to_string()),
                None => parent_name(&ds).map(str::to_string),
            };
        }
        None
    }

    fn describe(&self, name: &str, extra_props: &[String]) -> DriverResult<Dataset> {
        let node = self.node(name)?;
        let size = node.content.len() as u64;
        let mut ds = Dataset::new(name, node.dataset_type);
        ds.used = size;
        ds.referenced = size;
        ds.logicalused = size;
        ds.usedbydataset = size;
        ds.written = size;
        ds.compression = "off".to_string();
        if node.dataset_type == DatasetType::Filesystem {
            ds.mountpoint = format!("/{}", name);
            ds.avail = u64::MAX / 2;
        }
        for key in extra_props {
            if let Some(value) = self.resolve(name, key) {
                ds.extra_props.insert(key.clone(), value);
            }
        }
        Ok(ds)
    }

    fn is_under(name: &str, parent: &str) -> bool {
        name == parent
            || name
                .strip_prefix(parent)
                .map(|rest| rest.starts_with('/') || rest.starts_with('@'))
                .unwrap_or(false)
    }

    /// Dataset names in hierarchy order, snapshots after their filesystem in
    /// creation order.
    fn ordered_names(&self) -> Vec<&String> {
        let mut names: Vec<&String> = self.datasets.keys().collect();
        names.sort_by_key(|name| {
            let node = &self.datasets[*name];
            let fs = split_snapshot_name(name).map(|(fs, _)| fs).unwrap_or(name);
            (fs.to_string(), node.dataset_type == DatasetType::Snapshot, node.createtxg)
        });
        names
    }

    fn descendants(&self, dataset: &str, depth: u64) -> Vec<String> {
        let base_depth = dataset.matches('/').count() as u64;
        self.ordered_names()
            .into_iter()
            .filter(|name| name.as_str() != dataset && Self::is_under(name, dataset))
            .filter(|name| {
                if depth == 0 {
                    return true;
                }
                let fs = split_snapshot_name(name).map(|(fs, _)| fs).unwrap_or(name);
                let mut level = fs.matches('/').count() as u64 - base_depth;
                if split_snapshot_name(name).is_some() {
                    level += 1;
                }
                level <= depth
            })
            .cloned()
            .collect()
    }

    fn newest_snapshot(&self, filesystem: &str) -> Option<(&String, &Node)> {
        self.datasets
            .iter()
            .filter(|(name, _)| {
                split_snapshot_name(name)
                    .map(|(fs, _)| fs == filesystem)
                    .unwrap_or(false)
            })
            .max_by_key(|(_, node)| node.createtxg)
    }

    fn snapshot_by_guid(&self, filesystem: &str, guid: u64) -> Option<&Node> {
        self.datasets
            .iter()
            .find(|(name, node)| {
                node.guid == guid
                    && split_snapshot_name(name)
                        .map(|(fs, _)| fs == filesystem)
                        .unwrap_or(false)
            })
            .map(|(_, node)| node)
    }

    fn build_payload(&self, snapshot: &str, base_guid: Option<u64>) -> DriverResult<Vec<u8>> {
        let node = self.node(snapshot)?;
        match base_guid {
            None => Ok(stream::full_payload(&node.content)),
            Some(guid) => {
                let fs = split_snapshot_name(snapshot)
                    .map(|(fs, _)| fs)
                    .ok_or_else(|| DriverError::NotASnapshot {
                        name: snapshot.to_string(),
                    })?;
                let base = self
                    .snapshot_by_guid(fs, guid)
                    .ok_or_else(|| DriverError::stream("incremental base no longer exists"))?;
                Ok(stream::incremental_payload(&base.content, &node.content))
            }
        }
    }
}

/// Where a receive is going and what it continues from.
struct ReceivePlan {
    filesystem: String,
    snapshot: String,
    resumed: Option<PartialReceive>,
}

/// [`StorageDriver`] keeping all datasets in process memory.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
}

impl MemoryDriver {
    /// Creates an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a driver holding the filesystem `root` and its ancestors.
    pub fn with_root(root: &str) -> DriverResult<Self> {
        let driver = Self::new();
        driver.create_filesystem(root)?;
        Ok(driver)
    }

    /// Creates a filesystem, including missing ancestors.
    pub fn create_filesystem(&self, name: &str) -> DriverResult<Dataset> {
        validate_name(name)?;
        if split_snapshot_name(name).is_some() || name.contains('@') {
            return Err(DriverError::InvalidName {
                name: name.to_string(),
            });
        }
        let mut state = self.state.lock();
        let mut path = String::new();
        for component in name.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(component);
            match state.datasets.get(&path) {
                Some(node) if node.dataset_type != DatasetType::Filesystem => {
                    return Err(DriverError::Command {
                        msg: format!("{} is not a filesystem", path),
                    });
                }
                Some(_) => {}
                None => state.insert(&path, DatasetType::Filesystem, Vec::new(), rand::random()),
            }
        }
        state.describe(name, &[])
    }

    /// Replaces the live content of a filesystem.
    pub fn write_content(&self, filesystem: &str, content: &[u8]) -> DriverResult<()> {
        let mut state = self.state.lock();
        let node = state
            .datasets
            .get_mut(filesystem)
            .ok_or_else(|| DriverError::not_found(filesystem))?;
        if node.dataset_type == DatasetType::Snapshot {
            return Err(DriverError::Command {
                msg: format!("snapshot {} is read-only", filesystem),
            });
        }
        node.content = content.to_vec();
        Ok(())
    }

    /// Content of a dataset.
    pub fn read_content(&self, name: &str) -> DriverResult<Vec<u8>> {
        Ok(self.state.lock().node(name)?.content.clone())
    }

    /// Overrides the native creation time of a dataset.
    pub fn set_creation(&self, name: &str, created: DateTime<Utc>) -> DriverResult<()> {
        let mut state = self.state.lock();
        let node = state
            .datasets
            .get_mut(name)
            .ok_or_else(|| DriverError::not_found(name))?;
        node.created = created;
        Ok(())
    }

    fn plan_receive(&self, name: &str, header: &StreamHeader) -> DriverResult<ReceivePlan> {
        let (filesystem, snapshot) = match split_snapshot_name(name) {
            Some((fs, snap)) => (fs.to_string(), snap.to_string()),
            None => {
                let snap = split_snapshot_name(&header.source)
                    .map(|(_, snap)| snap.to_string())
                    .ok_or_else(|| DriverError::stream("stream source is not a snapshot"))?;
                (name.to_string(), snap)
            }
        };
        validate_name(&snapshot_full_name(&filesystem, &snapshot))?;

        let mut state = self.state.lock();
        let full = snapshot_full_name(&filesystem, &snapshot);
        if state.datasets.contains_key(&full) {
            return Err(DriverError::AlreadyExists { name: full });
        }

        let resumes = state
            .datasets
            .get(&filesystem)
            .and_then(|node| node.partial.as_ref())
            .map(|p| p.header.guid == header.guid && p.received.len() as u64 == header.offset);
        match resumes {
            Some(true) => {
                let resumed = state
                    .datasets
                    .get_mut(&filesystem)
                    .and_then(|node| node.partial.take());
                return Ok(ReceivePlan {
                    filesystem,
                    snapshot,
                    resumed,
                });
            }
            Some(false) => {
                return Err(DriverError::stream(format!(
                    "{} contains partially-complete state, resume it or destroy it first",
                    filesystem
                )));
            }
            None if header.offset > 0 => {
                return Err(DriverError::stream(format!(
                    "no partial receive state on {}",
                    filesystem
                )));
            }
            None => {}
        }

        match state.datasets.get(&filesystem) {
            Some(_) => match header.base_guid {
                None => return Err(DriverError::AlreadyExists { name: filesystem }),
                Some(base_guid) => {
                    let newest = state.newest_snapshot(&filesystem).map(|(_, n)| n.guid);
                    if newest != Some(base_guid) {
                        return Err(DriverError::stream(format!(
                            "incremental base does not match the newest snapshot of {}",
                            filesystem
                        )));
                    }
                }
            },
            None => {
                if header.base_guid.is_some() {
                    return Err(DriverError::not_found(&filesystem));
                }
                if let Some(parent) = parent_name(&filesystem) {
                    state.node(parent)?;
                }
            }
        }
        Ok(ReceivePlan {
            filesystem,
            snapshot,
            resumed: None,
        })
    }

    fn store_partial(&self, filesystem: &str, partial: PartialReceive) -> String {
        let token = partial.token();
        let mut state = self.state.lock();
        if !state.datasets.contains_key(filesystem) {
            state.insert(filesystem, DatasetType::Filesystem, Vec::new(), rand::random());
        }
        if let Some(node) = state.datasets.get_mut(filesystem) {
            node.partial = Some(partial);
        }
        token
    }

    fn commit_receive(&self, plan: &ReceivePlan, partial: PartialReceive) -> DriverResult<()> {
        let mut state = self.state.lock();
        let content = match partial.header.base_guid {
            None => partial.received,
            Some(guid) => {
                let base = state
                    .snapshot_by_guid(&plan.filesystem, guid)
                    .ok_or_else(|| DriverError::stream("incremental base disappeared"))?;
                stream::apply_incremental(&base.content, &partial.received)?
            }
        };
        if !state.datasets.contains_key(&plan.filesystem) {
            state.insert(
                &plan.filesystem,
                DatasetType::Filesystem,
                Vec::new(),
                rand::random(),
            );
        }
        let full = snapshot_full_name(&plan.filesystem, &plan.snapshot);
        state.insert(&full, DatasetType::Snapshot, content.clone(), partial.header.guid);
        if let Some(node) = state.datasets.get_mut(&plan.filesystem) {
            node.content = content;
            node.partial = None;
            for (key, value) in partial.header.props.iter() {
                node.props.insert(key.clone(), value.clone());
            }
            for (key, value) in partial.properties.iter() {
                node.props.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn list_datasets(&self, opts: ListOptions) -> DriverResult<Vec<Dataset>> {
        let state = self.state.lock();
        if !opts.parent.is_empty() {
            state.node(&opts.parent)?;
        }
        state
            .ordered_names()
            .into_iter()
            .filter(|name| {
                if opts.parent.is_empty() {
                    return true;
                }
                if opts.recursive {
                    State::is_under(name, &opts.parent)
                } else {
                    name.as_str() == opts.parent
                }
            })
            .filter(|name| opts.dataset_type.matches(state.datasets[*name].dataset_type))
            .map(|name| state.describe(name, &opts.extra_props))
            .collect()
    }

    async fn list_with_property(
        &self,
        dataset_type: DatasetType,
        parent: &str,
        property: &str,
    ) -> DriverResult<HashMap<String, String>> {
        let state = self.state.lock();
        state.node(parent)?;
        Ok(state
            .datasets
            .iter()
            .filter(|(name, node)| {
                State::is_under(name, parent) && dataset_type.matches(node.dataset_type)
            })
            .filter_map(|(name, node)| {
                node.props
                    .get(property)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect())
    }

    async fn get_dataset(&self, name: &str, extra_props: &[String]) -> DriverResult<Dataset> {
        self.state.lock().describe(name, extra_props)
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> DriverResult<()> {
        if READ_ONLY_PROPS.contains(&key) {
            return Err(DriverError::Command {
                msg: format!("property {} is read-only", key),
            });
        }
        let mut state = self.state.lock();
        let node = state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| DriverError::not_found(dataset))?;
        node.props.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn inherit_property(&self, dataset: &str, key: &str) -> DriverResult<()> {
        let mut state = self.state.lock();
        let node = state
            .datasets
            .get_mut(dataset)
            .ok_or_else(|| DriverError::not_found(dataset))?;
        node.props.remove(key);
        Ok(())
    }

    async fn create_snapshot(
        &self,
        dataset: &str,
        name: &str,
        recursive: bool,
    ) -> DriverResult<Dataset> {
        let full = snapshot_full_name(dataset, name);
        validate_name(&full)?;
        let mut state = self.state.lock();
        let node = state.node(dataset)?;
        if node.dataset_type == DatasetType::Snapshot {
            return Err(DriverError::Command {
                msg: format!("cannot snapshot a snapshot: {}", dataset),
            });
        }

        let mut targets = vec![dataset.to_string()];
        if recursive {
            targets.extend(
                state
                    .descendants(dataset, 0)
                    .into_iter()
                    .filter(|n| split_snapshot_name(n).is_none()),
            );
        }
        for target in &targets {
            let snap = snapshot_full_name(target, name);
            if state.datasets.contains_key(&snap) {
                return Err(DriverError::AlreadyExists { name: snap });
            }
        }
        for target in &targets {
            let content = state.node(target)?.content.clone();
            state.insert(
                &snapshot_full_name(target, name),
                DatasetType::Snapshot,
                content,
                rand::random(),
            );
        }
        debug!(snapshot = %full, recursive, "snapshot created");
        state.describe(&full, &[])
    }

    async fn destroy_dataset(&self, dataset: &str, flags: DestroyFlags) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.node(dataset)?;
        let descendants = state.descendants(dataset, 0);
        if !descendants.is_empty() && !flags.recursive {
            return Err(DriverError::Command {
                msg: format!("cannot destroy {}: dataset has children", dataset),
            });
        }
        for name in descendants {
            state.datasets.remove(&name);
        }
        state.datasets.remove(dataset);
        info!(dataset, "dataset destroyed");
        Ok(())
    }

    async fn send_stream(
        &self,
        snapshot: &str,
        writer: &mut StreamWriter<'_>,
        opts: SendOptions,
    ) -> DriverResult<()> {
        let (header, payload) = {
            let state = self.state.lock();
            let node = state.node(snapshot)?;
            if node.dataset_type != DatasetType::Snapshot {
                return Err(DriverError::NotASnapshot {
                    name: snapshot.to_string(),
                });
            }
            let base_guid = match opts.incremental_base.as_deref() {
                None => None,
                Some(base) => {
                    let base_node = state.node(base)?;
                    if base_node.dataset_type != DatasetType::Snapshot {
                        return Err(DriverError::NotASnapshot {
                            name: base.to_string(),
                        });
                    }
                    let same_fs = split_snapshot_name(base).map(|(fs, _)| fs)
                        == split_snapshot_name(snapshot).map(|(fs, _)| fs);
                    if !same_fs || base_node.createtxg >= node.createtxg {
                        return Err(DriverError::Command {
                            msg: format!("{} is not an earlier snapshot of the same filesystem", base),
                        });
                    }
                    Some(base_node.guid)
                }
            };
            let props = if opts.include_properties {
                let fs = split_snapshot_name(snapshot).map(|(fs, _)| fs).unwrap_or(snapshot);
                state.node(fs)?.props.clone()
            } else {
                BTreeMap::new()
            };
            let payload = state.build_payload(snapshot, base_guid)?;
            let header = StreamHeader {
                source: snapshot.to_string(),
                guid: node.guid,
                base_guid,
                offset: 0,
                total: payload.len() as u64,
                props,
            };
            (header, payload)
        };
        stream::write_stream(writer, &header, &payload).await
    }

    async fn receive_stream(
        &self,
        reader: &mut StreamReader<'_>,
        name: &str,
        opts: ReceiveOptions,
    ) -> DriverResult<Dataset> {
        let header = stream::read_header(reader).await?;
        let plan = self.plan_receive(name, &header)?;

        let mut partial = match plan.resumed.clone() {
            Some(mut resumed) => {
                resumed.properties.extend(opts.properties.clone());
                resumed
            }
            None => PartialReceive {
                header: header.clone(),
                received: Vec::new(),
                properties: opts.properties.clone(),
            },
        };
        let resumable = opts.resumable || plan.resumed.is_some();

        let expected = header.total - header.offset;
        let before = partial.received.len();
        let read_err = stream::read_payload(reader, expected, &mut partial.received).await;
        let got = (partial.received.len() - before) as u64;

        if got < expected {
            let reason = match read_err {
                Some(e) => format!("stream read failed after {} of {} bytes: {}", got, expected, e),
                None => format!("stream ended after {} of {} bytes", got, expected),
            };
            if resumable {
                let token = self.store_partial(&plan.filesystem, partial);
                info!(filesystem = %plan.filesystem, %reason, "receive interrupted, partial state kept");
                return Err(DriverError::ResumableStream { token });
            }
            return Err(DriverError::stream(reason));
        }

        self.commit_receive(&plan, partial)?;
        info!(filesystem = %plan.filesystem, snapshot = %plan.snapshot, "stream received");
        self.state
            .lock()
            .describe(&snapshot_full_name(&plan.filesystem, &plan.snapshot), &[])
    }

    async fn resume_send(&self, writer: &mut StreamWriter<'_>, token: &str) -> DriverResult<()> {
        let token = ResumeToken::decode(token)?;
        let (header, payload) = {
            let state = self.state.lock();
            let node = state.node(&token.source)?;
            if node.guid != token.guid {
                return Err(DriverError::stream(format!(
                    "{} no longer matches the resume token",
                    token.source
                )));
            }
            let payload = state.build_payload(&token.source, token.base_guid)?;
            if payload.len() as u64 != token.total || token.offset > token.total {
                return Err(DriverError::stream("resume token does not match the stream"));
            }
            let header = StreamHeader {
                source: token.source.clone(),
                guid: token.guid,
                base_guid: token.base_guid,
                offset: token.offset,
                total: token.total,
                props: BTreeMap::new(),
            };
            (header, payload)
        };
        stream::write_stream(writer, &header, &payload).await
    }

    async fn children(&self, dataset: &str, depth: u64) -> DriverResult<Vec<Dataset>> {
        let state = self.state.lock();
        state.node(dataset)?;
        state
            .descendants(dataset, depth)
            .iter()
            .map(|name| state.describe(name, &[]))
            .collect()
    }
}
