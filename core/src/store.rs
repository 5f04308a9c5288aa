use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::identity::content_tag;
use crate::item::{Chip, ClipItem, ClipKind, HistoryFilter, UNGROUPED};
use crate::now_epoch;

const SNAPSHOT_VERSION: u32 = 1;
const TAG_BACKFILL_FLAG: &str = "tag_backfill_done";
const BACKFILL_YIELD_MS: u64 = 10;
const DEFAULT_COMPRESS_THRESHOLD: usize = 4096;

const ITEM_COLUMNS: &str =
    "id, unique_id, kind, data, show_data, compressed, timestamp, app_path, app_name, \
     search_text, length, group_id, tag";

/// Durable table of `ClipItem` rows plus category chips. Owns the only
/// connection; every mutation serializes through the store-wide lock,
/// multi-statement writes run inside a transaction.
pub struct HistoryStore {
    conn: Mutex<Connection>,
    compress_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct ExportReport {
    pub exported: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    exported_at: i64,
    items: Vec<SnapshotRow>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRow {
    unique_id: String,
    kind: String,
    data: String,
    #[serde(default)]
    show_data: Option<String>,
    timestamp: i64,
    #[serde(default)]
    app_path: String,
    #[serde(default)]
    app_name: String,
    #[serde(default)]
    search_text: String,
    #[serde(default = "binary_length")]
    length: i64,
    #[serde(default = "ungrouped")]
    group: i64,
    #[serde(default)]
    tag: Option<String>,
}

fn binary_length() -> i64 {
    -1
}

fn ungrouped() -> i64 {
    UNGROUPED
}

struct RawRow {
    id: i64,
    unique_id: String,
    kind: String,
    data: Vec<u8>,
    show_data: Option<Vec<u8>>,
    compressed: bool,
    timestamp: i64,
    app_path: String,
    app_name: String,
    search_text: String,
    length: i64,
    group: i64,
    tag: Option<String>,
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        unique_id: row.get(1)?,
        kind: row.get(2)?,
        data: row.get(3)?,
        show_data: row.get(4)?,
        compressed: row.get::<_, i64>(5)? != 0,
        timestamp: row.get(6)?,
        app_path: row.get(7)?,
        app_name: row.get(8)?,
        search_text: row.get(9)?,
        length: row.get(10)?,
        group: row.get(11)?,
        tag: row.get(12)?,
    })
}

fn finish_row(raw: RawRow) -> Result<ClipItem, EngineError> {
    let kind = ClipKind::parse(&raw.kind)
        .ok_or_else(|| EngineError::InvalidData(format!("unknown kind '{}'", raw.kind)))?;
    let data = decode_payload(raw.data, raw.compressed)?;
    Ok(ClipItem {
        id: Some(raw.id),
        unique_id: raw.unique_id,
        kind,
        data,
        show_data: raw.show_data,
        timestamp: raw.timestamp,
        app_path: raw.app_path,
        app_name: raw.app_name,
        search_text: raw.search_text,
        length: raw.length,
        group: raw.group,
        tag: raw.tag,
    })
}

fn decode_payload(blob: Vec<u8>, compressed: bool) -> Result<Vec<u8>, EngineError> {
    if compressed {
        zstd::stream::decode_all(&blob[..])
            .map_err(|e| EngineError::InvalidData(format!("payload decompression: {e}")))
    } else {
        Ok(blob)
    }
}

fn like_escape(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// Single WHERE builder shared by search, count, and bulk delete so the
/// three can never disagree on matched rows.
fn filter_sql(filter: &HistoryFilter) -> (String, Vec<Value>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(group) = filter.group {
        clauses.push("group_id = ?".to_string());
        binds.push(Value::Integer(group));
    }
    if !filter.kinds.is_empty() {
        clauses.push(format!("kind IN ({})", placeholders(filter.kinds.len())));
        binds.extend(
            filter
                .kinds
                .iter()
                .map(|k| Value::Text(k.as_str().to_string())),
        );
    }
    if !filter.apps.is_empty() {
        clauses.push(format!("app_name IN ({})", placeholders(filter.apps.len())));
        binds.extend(filter.apps.iter().map(|a| Value::Text(a.clone())));
    }
    if !filter.tags.is_empty() {
        clauses.push(format!("tag IN ({})", placeholders(filter.tags.len())));
        binds.extend(filter.tags.iter().map(|t| Value::Text(t.clone())));
    }
    if let Some(query) = filter.query.as_deref() {
        if !query.is_empty() {
            clauses.push("search_text LIKE ? ESCAPE '\\'".to_string());
            binds.push(Value::Text(format!("%{}%", like_escape(query))));
        }
    }
    if let Some(since) = filter.since {
        clauses.push("timestamp >= ?".to_string());
        binds.push(Value::Integer(since));
    }
    if let Some(until) = filter.until {
        clauses.push("timestamp < ?".to_string());
        binds.push(Value::Integer(until));
    }

    if clauses.is_empty() {
        ("1=1".to_string(), binds)
    } else {
        (clauses.join(" AND "), binds)
    }
}

fn insert_row(
    conn: &Connection,
    item: &ClipItem,
    payload: &[u8],
    compressed: bool,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO items (unique_id, kind, data, show_data, compressed, timestamp, app_path, \
         app_name, search_text, length, group_id, tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            item.unique_id,
            item.kind.as_str(),
            payload,
            item.show_data,
            compressed as i64,
            item.timestamp,
            item.app_path,
            item.app_name,
            item.search_text,
            item.length,
            item.group,
            item.tag,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl HistoryStore {
    pub fn open(path: &Path, compress_threshold: usize) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;",
        )?;
        Self::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            compress_threshold,
        })
    }

    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        Self::init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
        })
    }

    fn init_db(conn: &Connection) -> Result<(), EngineError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                unique_id TEXT NOT NULL UNIQUE,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                show_data BLOB,
                compressed INTEGER NOT NULL DEFAULT 0,
                timestamp INTEGER NOT NULL,
                app_path TEXT NOT NULL DEFAULT '',
                app_name TEXT NOT NULL DEFAULT '',
                search_text TEXT NOT NULL DEFAULT '',
                length INTEGER NOT NULL DEFAULT -1,
                group_id INTEGER NOT NULL DEFAULT -1,
                tag TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_items_order ON items(timestamp DESC, id DESC);
            CREATE INDEX IF NOT EXISTS idx_items_group ON items(group_id);
            CREATE INDEX IF NOT EXISTS idx_items_tag ON items(tag);

            CREATE TABLE IF NOT EXISTS chips (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                color TEXT NOT NULL DEFAULT '',
                is_system INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        // schema migration for databases created before the tag column
        let has_tag: bool = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('items') WHERE name='tag'",
            [],
            |row| row.get::<_, i64>(0).map(|count| count > 0),
        )?;
        if !has_tag {
            conn.execute("ALTER TABLE items ADD COLUMN tag TEXT", [])?;
            conn.execute("CREATE INDEX IF NOT EXISTS idx_items_tag ON items(tag)", [])?;
        }

        conn.execute(
            "INSERT OR IGNORE INTO chips (id, name, color, is_system) VALUES (0, 'Pinned', '#f6b73c', 1)",
            [],
        )?;

        Ok(())
    }

    fn encode_payload(&self, data: &[u8]) -> (Vec<u8>, bool) {
        if data.len() > self.compress_threshold {
            match zstd::stream::encode_all(data, 3) {
                Ok(z) if z.len() < data.len() => return (z, true),
                _ => {}
            }
        }
        (data.to_vec(), false)
    }

    /// Insert with replace-on-conflict keyed on `unique_id`: an existing row
    /// with the same key is deleted first, so a recapture moves the item to
    /// the top of history instead of duplicating it. Returns the new row id
    /// and whether a row was replaced.
    pub fn insert(&self, item: &ClipItem) -> Result<(i64, bool), EngineError> {
        let (payload, compressed) = self.encode_payload(&item.data);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let replaced = tx.execute(
            "DELETE FROM items WHERE unique_id = ?1",
            params![item.unique_id],
        )? > 0;
        let id = insert_row(&tx, item, &payload, compressed)?;
        tx.commit()?;
        Ok((id, replaced))
    }

    /// Refresh a row's capture time so it resurfaces at the top of history.
    pub fn touch(&self, id: i64, now: i64) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE items SET timestamp = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<ClipItem>, EngineError> {
        let raw = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?1"))?;
            stmt.query_row(params![id], read_row).optional()?
        };
        raw.map(finish_row).transpose()
    }

    /// In-place edit of a text row: payload, projection, and tag change,
    /// the timestamp refreshes to `now`, the kind never does.
    pub fn update_content(
        &self,
        id: i64,
        data: &[u8],
        show_data: Option<&[u8]>,
        search_text: &str,
        length: i64,
        tag: &str,
    ) -> Result<(), EngineError> {
        let (payload, compressed) = self.encode_payload(data);
        let conn = self.conn.lock();
        let kind: Option<String> = conn
            .query_row("SELECT kind FROM items WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let kind = kind.ok_or_else(|| EngineError::InvalidData(format!("no item {id}")))?;
        let kind = ClipKind::parse(&kind)
            .ok_or_else(|| EngineError::InvalidData(format!("unknown kind '{kind}'")))?;
        if !kind.is_editable() {
            return Err(EngineError::InvalidData(format!(
                "{} items are not editable",
                kind.as_str()
            )));
        }
        conn.execute(
            "UPDATE items SET data = ?1, show_data = ?2, compressed = ?3, search_text = ?4, \
             length = ?5, tag = ?6, timestamp = ?7 WHERE id = ?8",
            params![
                payload,
                show_data,
                compressed as i64,
                search_text,
                length,
                tag,
                now_epoch(),
                id
            ],
        )?;
        Ok(())
    }

    /// Reassign the category; ordering is untouched. The target group must
    /// be `UNGROUPED` or a live chip.
    pub fn update_group(&self, id: i64, group: i64) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        if group != UNGROUPED {
            let live: Option<i64> = conn
                .query_row(
                    "SELECT id FROM chips WHERE id = ?1",
                    params![group],
                    |row| row.get(0),
                )
                .optional()?;
            if live.is_none() {
                return Err(EngineError::InvalidData(format!("no chip {group}")));
            }
        }
        conn.execute(
            "UPDATE items SET group_id = ?1 WHERE id = ?2",
            params![group, id],
        )?;
        Ok(())
    }

    pub fn search(
        &self,
        filter: &HistoryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ClipItem>, EngineError> {
        let (where_sql, mut binds) = filter_sql(filter);
        binds.push(Value::Integer(limit as i64));
        binds.push(Value::Integer(offset as i64));
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE {where_sql} \
             ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?"
        );
        self.query_items(&sql, binds)
    }

    /// Keyset variant: rows strictly after the `(timestamp, id)` cursor in
    /// display order. Robust to concurrent inserts shifting offsets.
    pub fn search_after(
        &self,
        filter: &HistoryFilter,
        cursor: Option<(i64, i64)>,
        limit: usize,
    ) -> Result<Vec<ClipItem>, EngineError> {
        let (where_sql, mut binds) = filter_sql(filter);
        let cursor_sql = match cursor {
            Some((timestamp, id)) => {
                binds.push(Value::Integer(timestamp));
                binds.push(Value::Integer(timestamp));
                binds.push(Value::Integer(id));
                " AND (timestamp < ? OR (timestamp = ? AND id < ?))"
            }
            None => "",
        };
        binds.push(Value::Integer(limit as i64));
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE {where_sql}{cursor_sql} \
             ORDER BY timestamp DESC, id DESC LIMIT ?"
        );
        self.query_items(&sql, binds)
    }

    fn query_items(&self, sql: &str, binds: Vec<Value>) -> Result<Vec<ClipItem>, EngineError> {
        let raws = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params_from_iter(binds), read_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raws.into_iter().map(finish_row).collect()
    }

    pub fn count(&self, filter: &HistoryFilter) -> Result<usize, EngineError> {
        let (where_sql, binds) = filter_sql(filter);
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM items WHERE {where_sql}"),
            params_from_iter(binds),
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn total_count(&self) -> Result<usize, EngineError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Filter facets: source applications, most recently seen first.
    pub fn distinct_app_info(&self) -> Result<Vec<(String, String)>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT app_name, app_path, MAX(timestamp) AS seen FROM items \
             WHERE app_name != '' GROUP BY app_name, app_path ORDER BY seen DESC",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn distinct_tags(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tag, MAX(timestamp) AS seen FROM items \
             WHERE tag IS NOT NULL GROUP BY tag ORDER BY seen DESC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_ids(&self, ids: &[i64]) -> Result<usize, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let sql = format!("DELETE FROM items WHERE id IN ({})", placeholders(ids.len()));
        let binds: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
        Ok(conn.execute(&sql, params_from_iter(binds))?)
    }

    pub fn delete_matching(&self, filter: &HistoryFilter) -> Result<usize, EngineError> {
        let (where_sql, binds) = filter_sql(filter);
        let conn = self.conn.lock();
        Ok(conn.execute(
            &format!("DELETE FROM items WHERE {where_sql}"),
            params_from_iter(binds),
        )?)
    }

    /// Retention sweep: evict rows older than the cutoff unless the user
    /// filed them into a category.
    pub fn delete_expired(&self, cutoff: i64) -> Result<usize, EngineError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM items WHERE timestamp < ?1 AND group_id = ?2",
            params![cutoff, UNGROUPED],
        )?)
    }

    pub fn drop_all(&self) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM items", [])?;
        Ok(())
    }

    pub fn list_chips(&self) -> Result<Vec<Chip>, EngineError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, color, is_system FROM chips ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Chip {
                id: row.get(0)?,
                name: row.get(1)?,
                color: row.get(2)?,
                is_system: row.get::<_, i64>(3)? != 0,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn create_chip(&self, name: &str, color: &str) -> Result<Chip, EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chips (id, name, color, is_system) \
             SELECT COALESCE(MAX(id), 0) + 1, ?1, ?2, 0 FROM chips",
            params![name, color],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Chip {
            id,
            name: name.to_string(),
            color: color.to_string(),
            is_system: false,
        })
    }

    pub fn rename_chip(&self, id: i64, name: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        self.guard_user_chip(&conn, id)?;
        conn.execute("UPDATE chips SET name = ?1 WHERE id = ?2", params![name, id])?;
        Ok(())
    }

    pub fn recolor_chip(&self, id: i64, color: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM chips WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(EngineError::InvalidData(format!("no chip {id}")));
        }
        conn.execute(
            "UPDATE chips SET color = ?1 WHERE id = ?2",
            params![color, id],
        )?;
        Ok(())
    }

    /// Remove a user chip. Member rows either fall back to `UNGROUPED` or
    /// are deleted with it, never left dangling.
    pub fn delete_chip(&self, id: i64, remove_items: bool) -> Result<(), EngineError> {
        let mut conn = self.conn.lock();
        {
            let guard = &*conn;
            self.guard_user_chip(guard, id)?;
        }
        let tx = conn.transaction()?;
        if remove_items {
            tx.execute("DELETE FROM items WHERE group_id = ?1", params![id])?;
        } else {
            tx.execute(
                "UPDATE items SET group_id = ?1 WHERE group_id = ?2",
                params![UNGROUPED, id],
            )?;
        }
        tx.execute("DELETE FROM chips WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    fn guard_user_chip(&self, conn: &Connection, id: i64) -> Result<(), EngineError> {
        let is_system: Option<bool> = conn
            .query_row(
                "SELECT is_system FROM chips WHERE id = ?1",
                params![id],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?;
        match is_system {
            None => Err(EngineError::InvalidData(format!("no chip {id}"))),
            Some(true) => Err(EngineError::InvalidData(format!(
                "chip {id} is system-defined"
            ))),
            Some(false) => Ok(()),
        }
    }

    /// Snapshot the full table to a self-describing portable file. The read
    /// runs inside one transaction, so the copy is point-in-time consistent.
    pub fn export_to(&self, path: &Path) -> Result<ExportReport, EngineError> {
        let raws = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {ITEM_COLUMNS} FROM items ORDER BY timestamp DESC, id DESC"
                ))?;
                let rows = stmt.query_map([], read_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.commit()?;
            rows
        };

        let mut items = Vec::with_capacity(raws.len());
        for raw in raws {
            let item = finish_row(raw)?;
            items.push(SnapshotRow {
                unique_id: item.unique_id,
                kind: item.kind.as_str().to_string(),
                data: BASE64.encode(&item.data),
                show_data: item.show_data.as_deref().map(|d| BASE64.encode(d)),
                timestamp: item.timestamp,
                app_path: item.app_path,
                app_name: item.app_name,
                search_text: item.search_text,
                length: item.length,
                group: item.group,
                tag: item.tag,
            });
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            exported_at: now_epoch(),
            items,
        };
        let exported = snapshot.items.len();
        let json = serde_json::to_string(&snapshot)
            .map_err(|e| EngineError::InvalidData(format!("snapshot serialization: {e}")))?;
        fs::write(path, json).map_err(|e| EngineError::io(path, e))?;
        info!("exported {exported} items to {}", path.display());
        Ok(ExportReport {
            exported,
            path: path.to_path_buf(),
        })
    }

    /// Additive merge of a snapshot file. The whole file is parsed and
    /// validated before the store is touched; rows whose `unique_id` already
    /// exists are skipped, never overwritten.
    pub fn import_from(&self, path: &Path) -> Result<ImportReport, EngineError> {
        let raw = fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .map_err(|e| EngineError::ImportValidation(format!("malformed snapshot: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::ImportValidation(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut pending = Vec::with_capacity(snapshot.items.len());
        for (idx, row) in snapshot.items.into_iter().enumerate() {
            let kind = ClipKind::parse(&row.kind).ok_or_else(|| {
                EngineError::ImportValidation(format!("row {idx}: unknown kind '{}'", row.kind))
            })?;
            if row.unique_id.is_empty() {
                return Err(EngineError::ImportValidation(format!(
                    "row {idx}: empty unique_id"
                )));
            }
            if row.timestamp <= 0 {
                return Err(EngineError::ImportValidation(format!(
                    "row {idx}: implausible timestamp {}",
                    row.timestamp
                )));
            }
            let data = BASE64.decode(&row.data).map_err(|e| {
                EngineError::ImportValidation(format!("row {idx}: payload not base64: {e}"))
            })?;
            let show_data = match &row.show_data {
                Some(encoded) => Some(BASE64.decode(encoded).map_err(|e| {
                    EngineError::ImportValidation(format!("row {idx}: preview not base64: {e}"))
                })?),
                None => None,
            };
            pending.push(ClipItem {
                id: None,
                unique_id: row.unique_id,
                kind,
                data,
                show_data,
                timestamp: row.timestamp,
                app_path: row.app_path,
                app_name: row.app_name,
                search_text: row.search_text,
                length: row.length,
                group: row.group,
                tag: row.tag,
            });
        }

        let mut imported = 0;
        let mut skipped = 0;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for item in &pending {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM items WHERE unique_id = ?1",
                    params![item.unique_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                skipped += 1;
                continue;
            }
            let (payload, compressed) = self.encode_payload(&item.data);
            insert_row(&tx, item, &payload, compressed)?;
            imported += 1;
        }
        tx.commit()?;
        info!("import finished: {imported} imported, {skipped} skipped");
        Ok(ImportReport { imported, skipped })
    }

    pub fn tag_backfill_done(&self) -> Result<bool, EngineError> {
        Ok(self.get_meta(TAG_BACKFILL_FLAG)?.is_some())
    }

    /// Recompute the `tag` column for rows that predate it, in bounded
    /// id-ordered batches with a short idle yield in between. Idempotent:
    /// each batch only touches rows still missing a tag. The completion
    /// flag is written only after a clean full pass, so an interrupted run
    /// resumes on the next launch.
    pub async fn backfill_tags(
        &self,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, EngineError> {
        let mut updated = 0;
        loop {
            if cancel.is_cancelled() {
                debug!("tag backfill interrupted after {updated} rows");
                return Ok(updated);
            }

            let batch: Vec<(i64, String, Vec<u8>, bool)> = {
                let conn = self.conn.lock();
                let mut stmt = conn
                    .prepare(
                        "SELECT id, kind, data, compressed FROM items \
                         WHERE tag IS NULL ORDER BY id LIMIT ?1",
                    )
                    .map_err(|e| EngineError::Migration(e.to_string()))?;
                let rows = stmt
                    .query_map(params![batch_size as i64], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get::<_, i64>(3)? != 0,
                        ))
                    })
                    .map_err(|e| EngineError::Migration(e.to_string()))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(|e| EngineError::Migration(e.to_string()))?
            };

            if batch.is_empty() {
                self.set_meta(TAG_BACKFILL_FLAG, "1")?;
                info!("tag backfill complete, {updated} rows updated");
                return Ok(updated);
            }

            {
                let mut conn = self.conn.lock();
                let tx = conn
                    .transaction()
                    .map_err(|e| EngineError::Migration(e.to_string()))?;
                for (id, kind, blob, compressed) in &batch {
                    let kind = ClipKind::parse(kind).ok_or_else(|| {
                        EngineError::Migration(format!("row {id}: unknown kind '{kind}'"))
                    })?;
                    let data = decode_payload(blob.clone(), *compressed)
                        .map_err(|e| EngineError::Migration(e.to_string()))?;
                    let tag = content_tag(kind, &data);
                    tx.execute(
                        "UPDATE items SET tag = ?1 WHERE id = ?2 AND tag IS NULL",
                        params![tag, id],
                    )
                    .map_err(|e| EngineError::Migration(e.to_string()))?;
                }
                tx.commit()
                    .map_err(|e| EngineError::Migration(e.to_string()))?;
            }

            updated += batch.len();
            tokio::time::sleep(Duration::from_millis(BACKFILL_YIELD_MS)).await;
        }
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>, EngineError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn strip_tags(&self) -> Result<(), EngineError> {
        let conn = self.conn.lock();
        conn.execute("UPDATE items SET tag = NULL", [])?;
        conn.execute("DELETE FROM meta WHERE key = ?1", params![TAG_BACKFILL_FLAG])?;
        Ok(())
    }
}
