//! SQLite storage layer for heya.
//!
//! Owns the single database connection for the process, applies bundled
//! schema migrations at open time, and regenerates the canonical schema
//! snapshot consumed by downstream code generation.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use heya_core::Settings;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Snapshot location used when the caller does not override it.
pub const DEFAULT_SCHEMA_PATH: &str = "sqlite/schema.sql";

/// Migration scripts compiled into the binary, one file per migration.
/// Names keep fixed-width zero-padded numeric prefixes so lexicographic
/// order is numeric order.
const BUNDLED_MIGRATIONS: &[(&str, &str)] = &[
    ("migration/0001.sql", include_str!("../migration/0001.sql")),
    ("migration/0002.sql", include_str!("../migration/0002.sql")),
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dsn required")]
    DsnRequired,
    #[error("cannot create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open database at {dsn}: {source}")]
    Connection {
        dsn: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("cannot create or query migrations table: {0}")]
    Ledger(#[source] rusqlite::Error),
    #[error("migration failed: name={name}: {source}")]
    Migration {
        name: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("migration script not found: {0}")]
    ScriptNotFound(String),
    #[error("failed querying schema catalog: {0}")]
    Catalog(#[source] rusqlite::Error),
    #[error("failed writing schema snapshot {path}: {source}")]
    SnapshotWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// A named, immutable unit of schema change.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MigrationScript {
    pub name: String,
    pub sql: String,
}

impl MigrationScript {
    #[must_use]
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self { name: name.into(), sql: sql.into() }
    }
}

/// An ordered, read-only bundle of migration scripts.
///
/// Enumeration is deterministic: scripts are sorted by lexicographic name
/// comparison at construction time.
#[derive(Debug, Clone, Default)]
pub struct MigrationSource {
    scripts: Vec<MigrationScript>,
}

impl MigrationSource {
    /// The scripts embedded at build time under `migration/*.sql`.
    #[must_use]
    pub fn bundled() -> Self {
        Self::from_scripts(
            BUNDLED_MIGRATIONS.iter().map(|(name, sql)| MigrationScript::new(*name, *sql)),
        )
    }

    #[must_use]
    pub fn from_scripts(scripts: impl IntoIterator<Item = MigrationScript>) -> Self {
        let mut scripts: Vec<MigrationScript> = scripts.into_iter().collect();
        scripts.sort_by(|a, b| a.name.cmp(&b.name));
        Self { scripts }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Script names in application order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.scripts.iter().map(|script| script.name.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MigrationScript> {
        self.scripts.iter()
    }

    /// Raw statement text for one script.
    ///
    /// # Errors
    /// Returns `StoreError::ScriptNotFound` when no script has that name.
    pub fn read(&self, name: &str) -> Result<&str> {
        self.scripts
            .iter()
            .find(|script| script.name == name)
            .map(|script| script.sql.as_str())
            .ok_or_else(|| StoreError::ScriptNotFound(name.to_string()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

impl<'a> IntoIterator for &'a MigrationSource {
    type Item = &'a MigrationScript;
    type IntoIter = std::slice::Iter<'a, MigrationScript>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Outcome of applying a single migration script.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MigrationOutcome {
    Applied,
    /// The ledger already had this name; the script was skipped. This is a
    /// skip signal, not an error.
    AlreadyApplied,
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub dsn: String,
    /// Where the schema snapshot is (re)written after migrations apply.
    pub schema_path: PathBuf,
}

impl StoreOptions {
    #[must_use]
    pub fn new(dsn: impl Into<String>) -> Self {
        Self { dsn: dsn.into(), schema_path: PathBuf::from(DEFAULT_SCHEMA_PATH) }
    }

    #[must_use]
    pub fn schema_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_path = path.into();
        self
    }
}

/// A persisted conversation header.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub model: String,
    pub created_at: String,
}

/// The open database handle. Single-threaded, synchronous: the migration
/// runner drives the executor sequentially over this one connection.
pub struct Db {
    conn: Connection,
    options: StoreOptions,
}

impl Db {
    /// Open the database, configure session pragmas, and run all bundled
    /// migrations as one startup step.
    ///
    /// # Errors
    /// Returns `StoreError::DsnRequired` for an empty DSN, `Connection` when
    /// the database cannot be opened or pragmas fail, and any migration or
    /// snapshot error from the migration run.
    pub fn open(options: StoreOptions) -> Result<Self> {
        Self::open_with_source(options, &MigrationSource::bundled())
    }

    /// Like [`Db::open`] but with an explicit migration bundle.
    ///
    /// # Errors
    /// See [`Db::open`].
    pub fn open_with_source(options: StoreOptions, source: &MigrationSource) -> Result<Self> {
        if options.dsn.is_empty() {
            return Err(StoreError::DsnRequired);
        }

        // Make the parent directory unless using an in-memory database.
        if options.dsn != ":memory:" {
            if let Some(parent) = Path::new(&options.dsn).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
            }
        }

        let conn = Connection::open(&options.dsn).map_err(|source| StoreError::Connection {
            dsn: options.dsn.clone(),
            source,
        })?;

        // WAL lets readers proceed while a writer is active; SQLite does not
        // enforce foreign keys unless asked. Both are session policy, set
        // once here rather than per transaction.
        conn.execute_batch(
            "PRAGMA journal_mode = wal;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|source| StoreError::Connection { dsn: options.dsn.clone(), source })?;

        let mut db = Self { conn, options };
        db.migrate(source)?;
        Ok(db)
    }

    /// Apply every unapplied script from `source` in sorted order, then
    /// regenerate the schema snapshot if anything newly applied.
    ///
    /// Already-applied scripts are skipped and logged at debug. The first
    /// fatal error aborts the run; earlier scripts stay committed since each
    /// runs in its own transaction.
    ///
    /// # Errors
    /// Returns `StoreError::Ledger` when the ledger table cannot be created,
    /// `Migration` for a failing script, and `Catalog`/`SnapshotWrite` when
    /// the snapshot cannot be regenerated.
    pub fn migrate(&mut self, source: &MigrationSource) -> Result<()> {
        self.conn
            .execute("CREATE TABLE IF NOT EXISTS migrations (name TEXT PRIMARY KEY)", [])
            .map_err(StoreError::Ledger)?;

        let mut newly_applied = 0_usize;
        for script in source {
            match self.apply_migration(script)? {
                MigrationOutcome::Applied => {
                    tracing::info!("applied migration {}", script.name);
                    newly_applied += 1;
                }
                MigrationOutcome::AlreadyApplied => {
                    tracing::debug!("skipping migration {}", script.name);
                }
            }
        }

        if newly_applied > 0 {
            self.dump_schema()?;
            tracing::debug!("schema dumped to {}", self.options.schema_path.display());
        }

        Ok(())
    }

    /// Apply one script transactionally, at most once.
    ///
    /// The ledger check, the script statements, and the ledger insert all run
    /// inside the same transaction. Dropping the transaction on any early
    /// exit rolls it back, so no partial application is ever visible.
    fn apply_migration(&mut self, script: &MigrationScript) -> Result<MigrationOutcome> {
        let fail = |source| StoreError::Migration { name: script.name.clone(), source };

        let tx = self.conn.transaction().map_err(fail)?;

        let applied: i64 = tx
            .query_row("SELECT COUNT(*) FROM migrations WHERE name = ?1", [&script.name], |row| {
                row.get(0)
            })
            .map_err(fail)?;
        if applied != 0 {
            return Ok(MigrationOutcome::AlreadyApplied);
        }

        tx.execute_batch(&script.sql).map_err(fail)?;
        tx.execute("INSERT INTO migrations (name) VALUES (?1)", [&script.name]).map_err(fail)?;
        tx.commit().map_err(fail)?;

        Ok(MigrationOutcome::Applied)
    }

    /// Migration names recorded in the ledger, sorted.
    ///
    /// # Errors
    /// Returns an error when the ledger cannot be queried.
    pub fn applied_migrations(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM migrations ORDER BY name")
            .map_err(StoreError::Ledger)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(StoreError::Ledger)?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row.map_err(StoreError::Ledger)?);
        }
        Ok(names)
    }

    /// Rewrite the schema snapshot wholesale: one `CREATE ...;` line per
    /// table, in catalog order.
    ///
    /// A failure here leaves already-committed migrations intact; the
    /// snapshot is a best-effort downstream artifact, not a source of truth.
    ///
    /// # Errors
    /// Returns `StoreError::Catalog` when the system catalog cannot be read
    /// and `SnapshotWrite` when the destination cannot be created or written.
    pub fn dump_schema(&self) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT sql FROM sqlite_master WHERE type = 'table' AND sql IS NOT NULL")
            .map_err(StoreError::Catalog)?;
        let mut rows = stmt.query([]).map_err(StoreError::Catalog)?;

        let path = &self.options.schema_path;
        let write_err =
            |source| StoreError::SnapshotWrite { path: path.clone(), source };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }
        let file = File::create(path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);

        while let Some(row) = rows.next().map_err(StoreError::Catalog)? {
            let sql: String = row.get(0).map_err(StoreError::Catalog)?;
            writeln!(writer, "{sql};").map_err(write_err)?;
        }
        writer.flush().map_err(write_err)?;

        Ok(())
    }

    /// Release the connection explicitly.
    ///
    /// # Errors
    /// Returns the underlying SQLite error when the handle cannot be closed.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, source)| StoreError::Sqlite(source))
    }

    /// The settings row, or `None` before bootstrap.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_settings(&self) -> Result<Option<Settings>> {
        let mut stmt = self
            .conn
            .prepare("SELECT codify, model, editor, temp FROM settings WHERE id = 1")?;
        let settings = stmt
            .query_row([], |row| {
                Ok(Settings {
                    codify: row.get(0)?,
                    model: row.get(1)?,
                    editor: row.get(2)?,
                    temp: row.get(3)?,
                })
            })
            .optional()?;
        Ok(settings)
    }

    /// Insert the settings row. Fails if one already exists.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_settings(&self, settings: &Settings) -> Result<()> {
        self.conn.execute(
            "INSERT INTO settings (id, codify, model, editor, temp) VALUES (1, ?1, ?2, ?3, ?4)",
            params![settings.codify, settings.model, settings.editor, settings.temp],
        )?;
        Ok(())
    }

    /// Overwrite the settings row.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_settings(&self, settings: &Settings) -> Result<()> {
        self.conn.execute(
            "UPDATE settings SET codify = ?1, model = ?2, editor = ?3, temp = ?4 WHERE id = 1",
            params![settings.codify, settings.model, settings.editor, settings.temp],
        )?;
        Ok(())
    }

    /// Existing settings, or freshly created defaults when none exist yet.
    ///
    /// # Errors
    /// Returns an error when reading or seeding the row fails.
    pub fn bootstrap_settings(&self) -> Result<Settings> {
        if let Some(existing) = self.get_settings()? {
            return Ok(existing);
        }
        let defaults = Settings::default();
        self.create_settings(&defaults)?;
        tracing::info!("seeded default settings");
        Ok(defaults)
    }

    /// Record a conversation header, returning its row id.
    ///
    /// # Errors
    /// Returns an error when the insert fails, including on a duplicate slug.
    pub fn record_conversation(&self, title: &str, slug: &str, model: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO conversations (title, slug, model) VALUES (?1, ?2, ?3)",
            params![title, slug, model],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Conversation headers, most recent first.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, slug, model, created_at FROM conversations ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                title: row.get(1)?,
                slug: row.get(2)?,
                model: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }
}

/// Create the next numbered migration file under `dir`.
///
/// Numbering continues after the highest existing `NNNN.sql`; names are
/// zero-padded to four digits so lexicographic order stays numeric order.
///
/// # Errors
/// Returns an error when the directory cannot be read or the file cannot be
/// created.
pub fn new_migration(dir: &Path) -> Result<PathBuf> {
    let mut highest = 0_u32;
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".sql") {
                if let Ok(number) = stem.parse::<u32>() {
                    highest = highest.max(number);
                }
            }
        }
    } else {
        fs::create_dir_all(dir)?;
    }

    let path = dir.join(format!("{:04}.sql", highest + 1));
    File::create(&path)?;
    Ok(path)
}
