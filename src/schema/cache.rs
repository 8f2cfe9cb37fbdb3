//! In-memory snapshot of the source catalog.
//!
//! Four collections mirror the catalog tables (objects, columns, users,
//! partitions). DML resolution consults the uncommitted overlay of its
//! own transaction first, then the committed layer; DDL mutates only the
//! overlay until its transaction commits. In adaptive mode any unseen
//! object resolves to a synthesized definition with generated column
//! names instead of blocking DML.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{DataObj, Obj, Xid};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColumnType {
    Char,
    Number,
    Date,
    Raw,
    Float,
    Double,
    Timestamp,
    TimestampTz,
    IntervalDts,
    IntervalYtm,
    Rowid,
    Clob,
    Blob,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaObject {
    pub obj: Obj,
    pub data_obj: DataObj,
    pub owner_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub obj: Obj,
    pub num: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub col_type: ColumnType,
    #[serde(default)]
    pub is_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaUser {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaPartition {
    pub data_obj: DataObj,
    pub base_obj: Obj,
}

/// Schema delta carried by a DDL vector and staged in the overlay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDelta {
    #[serde(default)]
    pub objects: Vec<SchemaObject>,
    #[serde(default)]
    pub drop_objects: Vec<Obj>,
    #[serde(default)]
    pub columns: Vec<SchemaColumn>,
    #[serde(default)]
    pub drop_columns: Vec<(Obj, u16)>,
    #[serde(default)]
    pub users: Vec<SchemaUser>,
    #[serde(default)]
    pub drop_users: Vec<u32>,
    #[serde(default)]
    pub partitions: Vec<SchemaPartition>,
    #[serde(default)]
    pub drop_partitions: Vec<DataObj>,
    #[serde(default)]
    pub ddl_text: Option<String>,
}

impl SchemaDelta {
    pub fn decode(payload: &[u8]) -> Result<SchemaDelta> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::redo(60004, format!("bad schema delta: {e}")))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn merge_into(&self, layer: &mut SchemaLayer) {
        for object in &self.objects {
            layer.objects.insert(object.obj, object.clone());
        }
        for obj in &self.drop_objects {
            layer.objects.remove(obj);
            layer.columns.retain(|&(o, _), _| o != *obj);
        }
        for column in &self.columns {
            layer.columns.insert((column.obj, column.num), column.clone());
        }
        for key in &self.drop_columns {
            layer.columns.remove(key);
        }
        for user in &self.users {
            layer.users.insert(user.id, user.clone());
        }
        for id in &self.drop_users {
            layer.users.remove(id);
        }
        for partition in &self.partitions {
            layer.partitions.insert(partition.data_obj, partition.clone());
        }
        for data_obj in &self.drop_partitions {
            layer.partitions.remove(data_obj);
        }
    }
}

/// Resolved view of one table, handed to the output builder.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub obj: Obj,
    pub owner: String,
    pub name: String,
    pub columns: Vec<SchemaColumn>,
    pub tag: Option<String>,
    pub adaptive: bool,
}

impl TableDef {
    pub fn column(&self, num: u16) -> Option<&SchemaColumn> {
        self.columns.iter().find(|c| c.num == num)
    }

    /// Column name for output; generated names fill adaptive gaps.
    pub fn column_name(&self, num: u16) -> String {
        match self.column(num) {
            Some(column) => column.name.clone(),
            None => format!("COL_{num}"),
        }
    }

    pub fn column_type(&self, num: u16) -> ColumnType {
        self.column(num).map(|c| c.col_type).unwrap_or(ColumnType::Unknown)
    }
}

#[derive(Debug, Default, Clone)]
struct SchemaLayer {
    objects: HashMap<Obj, SchemaObject>,
    columns: HashMap<(Obj, u16), SchemaColumn>,
    users: HashMap<u32, SchemaUser>,
    partitions: HashMap<DataObj, SchemaPartition>,
}

/// Table filter entry as configured.
#[derive(Debug, Clone)]
pub struct TableMatch {
    pub owner: String,
    pub table: String,
    pub tag: Option<String>,
}

struct CacheState {
    committed: SchemaLayer,
    overlay: HashMap<Xid, SchemaDelta>,
    version: u64,
}

/// Committed catalog plus per-transaction overlay, guarded by one
/// readers/writer lock: the parser reads, DDL commit and config reload
/// write.
pub struct SchemaCache {
    state: RwLock<CacheState>,
    filters: RwLock<Vec<TableMatch>>,
    adaptive: bool,
}

impl SchemaCache {
    pub fn new(adaptive: bool, filters: Vec<TableMatch>) -> Self {
        SchemaCache {
            state: RwLock::new(CacheState {
                committed: SchemaLayer::default(),
                overlay: HashMap::new(),
                version: 0,
            }),
            filters: RwLock::new(filters),
            adaptive,
        }
    }

    /// Resolves `obj` for DML of transaction `xid`, overlay first.
    ///
    /// Returns `None` when the object is unknown and adaptive mode is
    /// off, or when a filter list exists and the table is not on it.
    pub fn resolve(&self, obj: Obj, xid: Xid) -> Option<TableDef> {
        let state = self.state.read();

        let mut object: Option<SchemaObject> = None;
        let mut columns: HashMap<u16, SchemaColumn> = HashMap::new();

        if let Some(found) = state.committed.objects.get(&obj) {
            object = Some(found.clone());
            for ((o, num), column) in &state.committed.columns {
                if *o == obj {
                    columns.insert(*num, column.clone());
                }
            }
        }
        if let Some(delta) = state.overlay.get(&xid) {
            if delta.drop_objects.contains(&obj) {
                object = None;
                columns.clear();
            }
            if let Some(found) = delta.objects.iter().find(|o| o.obj == obj) {
                object = Some(found.clone());
            }
            for column in delta.columns.iter().filter(|c| c.obj == obj) {
                columns.insert(column.num, column.clone());
            }
            for (o, num) in &delta.drop_columns {
                if *o == obj {
                    columns.remove(num);
                }
            }
        }

        match object {
            Some(object) => {
                let owner = state
                    .committed
                    .users
                    .get(&object.owner_id)
                    .map(|u| u.name.clone())
                    .unwrap_or_else(|| format!("USER_{}", object.owner_id));
                let tag = self.filter_tag(&owner, &object.name)?;
                let mut columns: Vec<SchemaColumn> = columns.into_values().collect();
                columns.sort_by_key(|c| c.num);
                Some(TableDef { obj, owner, name: object.name, columns, tag, adaptive: false })
            }
            None if self.adaptive => Some(TableDef {
                obj,
                owner: "UNKNOWN".to_string(),
                name: format!("OBJ_{obj}"),
                columns: Vec::new(),
                tag: None,
                adaptive: true,
            }),
            None => None,
        }
    }

    /// Resolves a partition's base object, falling back to the identity
    /// mapping when no partition row exists.
    pub fn base_obj(&self, data_obj: DataObj) -> Obj {
        let state = self.state.read();
        state
            .committed
            .partitions
            .get(&data_obj)
            .map(|p| p.base_obj)
            .unwrap_or(data_obj)
    }

    /// Stages a DDL delta under its transaction.
    pub fn stage(&self, xid: Xid, delta: SchemaDelta) {
        let mut state = self.state.write();
        let staged = state.overlay.entry(xid).or_default();
        // Later vectors of the same transaction accumulate.
        staged.objects.extend(delta.objects);
        staged.drop_objects.extend(delta.drop_objects);
        staged.columns.extend(delta.columns);
        staged.drop_columns.extend(delta.drop_columns);
        staged.users.extend(delta.users);
        staged.drop_users.extend(delta.drop_users);
        staged.partitions.extend(delta.partitions);
        staged.drop_partitions.extend(delta.drop_partitions);
        if delta.ddl_text.is_some() {
            staged.ddl_text = delta.ddl_text;
        }
        debug!(%xid, "staged ddl delta");
    }

    /// Merges the transaction's overlay slice into the committed layer.
    /// Returns the delta for the schema-change event, if any was staged.
    pub fn merge(&self, xid: Xid) -> Option<SchemaDelta> {
        let mut state = self.state.write();
        let delta = state.overlay.remove(&xid)?;
        delta.merge_into(&mut state.committed);
        state.version += 1;
        info!(%xid, version = state.version, "schema change committed");
        Some(delta)
    }

    /// Drops the transaction's overlay slice on rollback.
    pub fn discard(&self, xid: Xid) {
        self.state.write().overlay.remove(&xid);
    }

    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    /// Serialized committed layer for checkpoint records. Collections
    /// are sorted so the digest is stable across runs.
    pub fn snapshot(&self) -> Result<String> {
        let state = self.state.read();
        let mut objects: Vec<SchemaObject> = state.committed.objects.values().cloned().collect();
        objects.sort_by_key(|o| o.obj);
        let mut columns: Vec<SchemaColumn> = state.committed.columns.values().cloned().collect();
        columns.sort_by_key(|c| (c.obj, c.num));
        let mut users: Vec<SchemaUser> = state.committed.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        let mut partitions: Vec<SchemaPartition> =
            state.committed.partitions.values().cloned().collect();
        partitions.sort_by_key(|p| p.data_obj);

        let body = serde_json::to_string(&SnapshotBody {
            objects,
            columns,
            users,
            partitions,
            version: state.version,
        })?;
        Ok(body)
    }

    pub fn digest(&self) -> Result<u32> {
        Ok(crc32fast::hash(self.snapshot()?.as_bytes()))
    }

    /// Restores the committed layer from a checkpoint body, dropping any
    /// overlay state.
    pub fn restore(&self, body: &str) -> Result<()> {
        let snapshot: SnapshotBody = serde_json::from_str(body)
            .map_err(|e| Error::data(20002, format!("bad schema snapshot: {e}")))?;
        let mut state = self.state.write();
        state.committed = SchemaLayer {
            objects: snapshot.objects.into_iter().map(|o| (o.obj, o)).collect(),
            columns: snapshot.columns.into_iter().map(|c| ((c.obj, c.num), c)).collect(),
            users: snapshot.users.into_iter().map(|u| (u.id, u)).collect(),
            partitions: snapshot.partitions.into_iter().map(|p| (p.data_obj, p)).collect(),
        };
        state.version = snapshot.version;
        state.overlay.clear();
        Ok(())
    }

    /// Replaces the filter list on config reload.
    pub fn set_filters(&self, filters: Vec<TableMatch>) {
        *self.filters.write() = filters;
    }

    /// `Some(tag)` when the table passes the filter (tag may be absent),
    /// `None` when a filter list exists and the table is not on it.
    fn filter_tag(&self, owner: &str, table: &str) -> Option<Option<String>> {
        let filters = self.filters.read();
        if filters.is_empty() {
            return Some(None);
        }
        filters
            .iter()
            .find(|f| {
                (f.owner == "*" || f.owner.eq_ignore_ascii_case(owner))
                    && (f.table == "*" || f.table.eq_ignore_ascii_case(table))
            })
            .map(|f| f.tag.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotBody {
    objects: Vec<SchemaObject>,
    columns: Vec<SchemaColumn>,
    users: Vec<SchemaUser>,
    partitions: Vec<SchemaPartition>,
    version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_with_table() -> SchemaDelta {
        SchemaDelta {
            objects: vec![SchemaObject { obj: 101, data_obj: 101, owner_id: 1, name: "USERS".into() }],
            columns: vec![
                SchemaColumn { obj: 101, num: 1, name: "ID".into(), col_type: ColumnType::Number, is_key: true },
                SchemaColumn { obj: 101, num: 2, name: "NAME".into(), col_type: ColumnType::Char, is_key: false },
            ],
            users: vec![SchemaUser { id: 1, name: "APP".into() }],
            ..Default::default()
        }
    }

    #[test]
    fn overlay_resolves_before_commit() {
        let cache = SchemaCache::new(false, vec![]);
        let xid = Xid::new(1, 0, 1);

        assert!(cache.resolve(101, xid).is_none());
        cache.stage(xid, delta_with_table());

        let table = cache.resolve(101, xid).unwrap();
        assert_eq!(table.name, "USERS");
        assert_eq!(table.owner, "APP");
        assert_eq!(table.column_name(2), "NAME");

        // Another transaction does not see the overlay.
        assert!(cache.resolve(101, Xid::new(9, 9, 9)).is_none());
    }

    #[test]
    fn merge_publishes_discard_drops() {
        let cache = SchemaCache::new(false, vec![]);
        let xid = Xid::new(1, 0, 1);
        cache.stage(xid, delta_with_table());
        let delta = cache.merge(xid).unwrap();
        assert_eq!(delta.objects.len(), 1);
        assert_eq!(cache.version(), 1);

        // Now visible to everyone.
        assert!(cache.resolve(101, Xid::new(9, 9, 9)).is_some());

        let xid2 = Xid::new(2, 0, 1);
        cache.stage(
            xid2,
            SchemaDelta { drop_objects: vec![101], ..Default::default() },
        );
        assert!(cache.resolve(101, xid2).is_none());
        cache.discard(xid2);
        assert!(cache.resolve(101, xid2).is_some());
    }

    #[test]
    fn adaptive_mode_synthesizes_tables() {
        let cache = SchemaCache::new(true, vec![]);
        let table = cache.resolve(4242, Xid::new(1, 0, 1)).unwrap();
        assert!(table.adaptive);
        assert_eq!(table.name, "OBJ_4242");
        assert_eq!(table.column_name(1), "COL_1");
        assert_eq!(table.column_type(1), ColumnType::Unknown);
    }

    #[test]
    fn filters_limit_resolution() {
        let cache = SchemaCache::new(false, vec![TableMatch {
            owner: "APP".into(),
            table: "ORDERS".into(),
            tag: Some("t1".into()),
        }]);
        let xid = Xid::new(1, 0, 1);
        cache.stage(xid, delta_with_table());
        cache.merge(xid);

        // USERS is not on the filter list.
        assert!(cache.resolve(101, xid).is_none());

        cache.set_filters(vec![TableMatch { owner: "APP".into(), table: "USERS".into(), tag: Some("t2".into()) }]);
        let table = cache.resolve(101, xid).unwrap();
        assert_eq!(table.tag.as_deref(), Some("t2"));
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let cache = SchemaCache::new(false, vec![]);
        let xid = Xid::new(1, 0, 1);
        cache.stage(xid, delta_with_table());
        cache.merge(xid);

        let body = cache.snapshot().unwrap();
        let digest = cache.digest().unwrap();

        let restored = SchemaCache::new(false, vec![]);
        restored.restore(&body).unwrap();
        assert_eq!(restored.version(), 1);
        assert_eq!(restored.digest().unwrap(), digest);
        assert!(restored.resolve(101, Xid::new(5, 5, 5)).is_some());
    }

    #[test]
    fn delta_payload_roundtrip() {
        let delta = delta_with_table();
        let decoded = SchemaDelta::decode(&delta.encode()).unwrap();
        assert_eq!(decoded.objects[0].name, "USERS");
        assert_eq!(decoded.columns.len(), 2);
    }
}
