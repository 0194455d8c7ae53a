//! SQLite persistence layer.
//!
//! One table per entity kind; policies and manifests live as columns of the
//! application row they belong to. Every public operation runs in its own
//! transaction; multi-operation atomicity goes through [`SqlStorage::transaction`].
//! Uses WAL mode; the schema is versioned through `PRAGMA user_version`.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use busguard_core::{
    AppMetadata, Application, Certificate, Error, GroupInfo, Guid, IdentityCertificate,
    IdentityInfo, Manifest, MembershipCertificate, Policy, PublicKey, Result,
};

const SCHEMA_VERSION: i32 = 1;

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Durable store for the agent's security state.
///
/// All access is serialized through a process-wide mutex over the connection.
pub struct SqlStorage {
    db: Mutex<Connection>,
}

impl SqlStorage {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        Self::init(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(storage_err)?;
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(storage_err)?;
        if version > SCHEMA_VERSION {
            return Err(Error::Storage(format!(
                "store schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        if version < SCHEMA_VERSION {
            Self::migrate(&conn)?;
        }
        Ok(SqlStorage { db: Mutex::new(conn) })
    }

    fn migrate(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS applications (
                public_key        BLOB PRIMARY KEY,
                aki               TEXT NOT NULL,
                app_name          TEXT NOT NULL DEFAULT '',
                device_name       TEXT NOT NULL DEFAULT '',
                user_defined_name TEXT NOT NULL DEFAULT '',
                updates_pending   INTEGER NOT NULL DEFAULT 0,
                policy            BLOB,
                manifest          BLOB
            );

            CREATE TABLE IF NOT EXISTS identity_certs (
                subject_public_key BLOB PRIMARY KEY,
                serial             TEXT NOT NULL,
                der                BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS membership_certs (
                subject_public_key BLOB NOT NULL,
                guild              BLOB NOT NULL,
                serial             TEXT NOT NULL,
                der                BLOB NOT NULL,
                PRIMARY KEY (subject_public_key, guild)
            );

            CREATE INDEX IF NOT EXISTS idx_membership_guild ON membership_certs(guild);

            CREATE TABLE IF NOT EXISTS groups (
                authority BLOB NOT NULL,
                guid      BLOB NOT NULL,
                name      TEXT NOT NULL DEFAULT '',
                descr     TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (authority, guid)
            );

            CREATE TABLE IF NOT EXISTS identities (
                authority BLOB NOT NULL,
                guid      BLOB NOT NULL,
                name      TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (authority, guid)
            );

            CREATE TABLE IF NOT EXISTS serial_counter (
                id    INTEGER PRIMARY KEY CHECK (id = 0),
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO serial_counter (id, value) VALUES (0, 1);

            CREATE TABLE IF NOT EXISTS ca_keys (
                id  INTEGER PRIMARY KEY CHECK (id = 0),
                key BLOB NOT NULL
            );
            ",
        )
        .map_err(storage_err)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(storage_err)?;
        Ok(())
    }

    /// Run `scope` inside one exclusive transaction. Commits when the scope
    /// returns `Ok`, rolls back on any `Err`.
    pub fn transaction<T>(&self, scope: impl FnOnce(&StorageTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(storage_err)?;
        match scope(&StorageTx { conn: &tx }) {
            Ok(value) => {
                tx.commit().map_err(storage_err)?;
                Ok(value)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                drop(tx);
                Err(e)
            }
        }
    }

    // ─── Single-operation wrappers ───────────────────────────────────────

    pub fn store_application(&self, app: &Application, upsert: bool) -> Result<()> {
        self.transaction(|tx| tx.store_application(app, upsert))
    }

    pub fn remove_application(&self, app: &Application) -> Result<()> {
        self.transaction(|tx| tx.remove_application(app))
    }

    pub fn get_managed_application(&self, key: &PublicKey) -> Result<Application> {
        self.transaction(|tx| tx.get_managed_application(key))
    }

    pub fn get_managed_applications(&self) -> Result<Vec<Application>> {
        self.transaction(|tx| tx.get_managed_applications())
    }

    pub fn set_app_metadata(&self, key: &PublicKey, meta: &AppMetadata) -> Result<()> {
        self.transaction(|tx| tx.set_app_metadata(key, meta))
    }

    pub fn get_app_metadata(&self, key: &PublicKey) -> Result<AppMetadata> {
        self.transaction(|tx| Ok(tx.get_managed_application(key)?.meta))
    }

    pub fn store_certificate(&self, cert: &Certificate, upsert: bool) -> Result<()> {
        self.transaction(|tx| tx.store_certificate(cert, upsert))
    }

    pub fn remove_certificate(&self, cert: &Certificate) -> Result<()> {
        self.transaction(|tx| tx.remove_certificate(cert))
    }

    pub fn get_identity_certificate(&self, subject: &PublicKey) -> Result<IdentityCertificate> {
        self.transaction(|tx| tx.get_identity_certificate(subject))
    }

    pub fn get_membership_certificate(
        &self,
        subject: &PublicKey,
        guild: &Guid,
    ) -> Result<MembershipCertificate> {
        self.transaction(|tx| tx.get_membership_certificate(subject, guild))
    }

    /// Query membership certificates: by subject, by guild, or both.
    pub fn get_membership_certificates(
        &self,
        subject: Option<&PublicKey>,
        guild: Option<&Guid>,
    ) -> Result<Vec<MembershipCertificate>> {
        self.transaction(|tx| tx.get_membership_certificates(subject, guild))
    }

    pub fn store_policy(&self, key: &PublicKey, policy: &Policy) -> Result<()> {
        self.transaction(|tx| tx.store_policy(key, policy))
    }

    pub fn get_policy(&self, key: &PublicKey) -> Result<Policy> {
        self.transaction(|tx| tx.get_policy(key))
    }

    pub fn store_manifest(&self, key: &PublicKey, manifest: &Manifest) -> Result<()> {
        self.transaction(|tx| tx.store_manifest(key, manifest))
    }

    pub fn get_manifest(&self, key: &PublicKey) -> Result<Manifest> {
        self.transaction(|tx| tx.get_manifest(key))
    }

    pub fn store_group(&self, group: &GroupInfo) -> Result<()> {
        self.transaction(|tx| tx.store_group(group))
    }

    pub fn remove_group(&self, authority: &PublicKey, guid: &Guid) -> Result<()> {
        self.transaction(|tx| tx.remove_group(authority, guid))
    }

    pub fn get_group(&self, authority: &PublicKey, guid: &Guid) -> Result<GroupInfo> {
        self.transaction(|tx| tx.get_group(authority, guid))
    }

    pub fn get_groups(&self) -> Result<Vec<GroupInfo>> {
        self.transaction(|tx| tx.get_groups())
    }

    pub fn store_identity(&self, identity: &IdentityInfo) -> Result<()> {
        self.transaction(|tx| tx.store_identity(identity))
    }

    pub fn remove_identity(&self, authority: &PublicKey, guid: &Guid) -> Result<()> {
        self.transaction(|tx| tx.remove_identity(authority, guid))
    }

    pub fn get_identity(&self, authority: &PublicKey, guid: &Guid) -> Result<IdentityInfo> {
        self.transaction(|tx| tx.get_identity(authority, guid))
    }

    pub fn get_identities(&self) -> Result<Vec<IdentityInfo>> {
        self.transaction(|tx| tx.get_identities())
    }

    /// Atomically read and advance the serial counter. Serial numbers are
    /// decimal strings, strictly increasing, never reused.
    pub fn get_new_serial(&self) -> Result<String> {
        self.transaction(|tx| tx.get_new_serial())
    }

    /// The persisted CA key blob, if one exists. Lives outside the state
    /// tables so the key can be rotated independently.
    pub fn load_ca_key(&self) -> Result<Option<Vec<u8>>> {
        self.transaction(|tx| {
            tx.conn
                .query_row("SELECT key FROM ca_keys WHERE id = 0", [], |row| row.get(0))
                .optional()
                .map_err(storage_err)
        })
    }

    pub fn store_ca_key(&self, key: &[u8]) -> Result<()> {
        self.transaction(|tx| {
            tx.conn
                .execute(
                    "INSERT INTO ca_keys (id, key) VALUES (0, ?1)
                     ON CONFLICT(id) DO UPDATE SET key = ?1",
                    params![key],
                )
                .map_err(storage_err)?;
            Ok(())
        })
    }

    /// Drop all security state and restart the serial counter.
    pub fn reset(&self) -> Result<()> {
        self.transaction(|tx| {
            tx.conn
                .execute_batch(
                    "
                    DELETE FROM applications;
                    DELETE FROM identity_certs;
                    DELETE FROM membership_certs;
                    DELETE FROM groups;
                    DELETE FROM identities;
                    UPDATE serial_counter SET value = 1 WHERE id = 0;
                    ",
                )
                .map_err(storage_err)?;
            Ok(())
        })
    }
}

/// Storage operations available inside an open transaction.
pub struct StorageTx<'a> {
    conn: &'a Connection,
}

impl StorageTx<'_> {
    // ─── Applications ────────────────────────────────────────────────────

    pub fn store_application(&self, app: &Application, upsert: bool) -> Result<()> {
        let exists = self.application_exists(&app.public_key)?;
        if upsert && !exists {
            return Err(Error::NotFound);
        }
        if !upsert && exists {
            return Err(Error::AlreadyExists);
        }
        if exists {
            self.conn
                .execute(
                    "UPDATE applications
                     SET aki = ?2, app_name = ?3, device_name = ?4,
                         user_defined_name = ?5, updates_pending = ?6
                     WHERE public_key = ?1",
                    params![
                        app.public_key.as_bytes().as_slice(),
                        app.aki,
                        app.meta.app_name,
                        app.meta.device_name,
                        app.meta.user_defined_name,
                        app.updates_pending,
                    ],
                )
                .map_err(storage_err)?;
        } else {
            self.conn
                .execute(
                    "INSERT INTO applications
                     (public_key, aki, app_name, device_name, user_defined_name, updates_pending)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        app.public_key.as_bytes().as_slice(),
                        app.aki,
                        app.meta.app_name,
                        app.meta.device_name,
                        app.meta.user_defined_name,
                        app.updates_pending,
                    ],
                )
                .map_err(storage_err)?;
        }
        Ok(())
    }

    /// Remove an application and every certificate issued to it.
    pub fn remove_application(&self, app: &Application) -> Result<()> {
        let key = app.public_key.as_bytes().as_slice();
        let removed = self
            .conn
            .execute("DELETE FROM applications WHERE public_key = ?1", params![key])
            .map_err(storage_err)?;
        if removed == 0 {
            return Err(Error::EndOfData);
        }
        self.conn
            .execute("DELETE FROM identity_certs WHERE subject_public_key = ?1", params![key])
            .map_err(storage_err)?;
        self.conn
            .execute("DELETE FROM membership_certs WHERE subject_public_key = ?1", params![key])
            .map_err(storage_err)?;
        Ok(())
    }

    fn application_exists(&self, key: &PublicKey) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM applications WHERE public_key = ?1",
                params![key.as_bytes().as_slice()],
                |_| Ok(()),
            )
            .optional()
            .map_err(storage_err)
            .map(|found| found.is_some())
    }

    pub fn get_managed_application(&self, key: &PublicKey) -> Result<Application> {
        let row = self
            .conn
            .query_row(
                "SELECT aki, app_name, device_name, user_defined_name, updates_pending
                 FROM applications WHERE public_key = ?1",
                params![key.as_bytes().as_slice()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(storage_err)?;
        let Some((aki, app_name, device_name, user_defined_name, updates_pending)) = row else {
            return Err(Error::EndOfData);
        };
        Ok(Application {
            public_key: *key,
            aki,
            updates_pending,
            meta: AppMetadata { app_name, device_name, user_defined_name },
        })
    }

    pub fn get_managed_applications(&self) -> Result<Vec<Application>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT public_key, aki, app_name, device_name, user_defined_name, updates_pending
                 FROM applications",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        let mut apps = Vec::with_capacity(rows.len());
        for (key, aki, app_name, device_name, user_defined_name, updates_pending) in rows {
            apps.push(Application {
                public_key: PublicKey::from_bytes(&key)?,
                aki,
                updates_pending,
                meta: AppMetadata { app_name, device_name, user_defined_name },
            });
        }
        Ok(apps)
    }

    pub fn set_app_metadata(&self, key: &PublicKey, meta: &AppMetadata) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE applications
                 SET app_name = ?2, device_name = ?3, user_defined_name = ?4
                 WHERE public_key = ?1",
                params![
                    key.as_bytes().as_slice(),
                    meta.app_name,
                    meta.device_name,
                    meta.user_defined_name,
                ],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    // ─── Certificates ────────────────────────────────────────────────────

    pub fn store_certificate(&self, cert: &Certificate, upsert: bool) -> Result<()> {
        match cert {
            Certificate::Identity(cert) => {
                let exists = self
                    .conn
                    .query_row(
                        "SELECT 1 FROM identity_certs WHERE subject_public_key = ?1",
                        params![cert.subject_public_key.as_bytes().as_slice()],
                        |_| Ok(()),
                    )
                    .optional()
                    .map_err(storage_err)?
                    .is_some();
                if exists && !upsert {
                    return Err(Error::AlreadyExists);
                }
                self.conn
                    .execute(
                        "INSERT INTO identity_certs (subject_public_key, serial, der)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(subject_public_key) DO UPDATE SET serial = ?2, der = ?3",
                        params![
                            cert.subject_public_key.as_bytes().as_slice(),
                            cert.serial,
                            cert.encode()?,
                        ],
                    )
                    .map_err(storage_err)?;
            }
            Certificate::Membership(cert) => {
                let exists = self
                    .conn
                    .query_row(
                        "SELECT 1 FROM membership_certs
                         WHERE subject_public_key = ?1 AND guild = ?2",
                        params![
                            cert.subject_public_key.as_bytes().as_slice(),
                            cert.guild.as_bytes().as_slice(),
                        ],
                        |_| Ok(()),
                    )
                    .optional()
                    .map_err(storage_err)?
                    .is_some();
                if exists && !upsert {
                    return Err(Error::AlreadyExists);
                }
                self.conn
                    .execute(
                        "INSERT INTO membership_certs (subject_public_key, guild, serial, der)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(subject_public_key, guild) DO UPDATE SET serial = ?3, der = ?4",
                        params![
                            cert.subject_public_key.as_bytes().as_slice(),
                            cert.guild.as_bytes().as_slice(),
                            cert.serial,
                            cert.encode()?,
                        ],
                    )
                    .map_err(storage_err)?;
            }
        }
        Ok(())
    }

    pub fn remove_certificate(&self, cert: &Certificate) -> Result<()> {
        let removed = match cert {
            Certificate::Identity(cert) => self
                .conn
                .execute(
                    "DELETE FROM identity_certs WHERE subject_public_key = ?1",
                    params![cert.subject_public_key.as_bytes().as_slice()],
                )
                .map_err(storage_err)?,
            Certificate::Membership(cert) => self
                .conn
                .execute(
                    "DELETE FROM membership_certs WHERE subject_public_key = ?1 AND guild = ?2",
                    params![
                        cert.subject_public_key.as_bytes().as_slice(),
                        cert.guild.as_bytes().as_slice(),
                    ],
                )
                .map_err(storage_err)?,
        };
        if removed == 0 {
            return Err(Error::EndOfData);
        }
        Ok(())
    }

    pub fn get_identity_certificate(&self, subject: &PublicKey) -> Result<IdentityCertificate> {
        let der: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT der FROM identity_certs WHERE subject_public_key = ?1",
                params![subject.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        match der {
            Some(der) => IdentityCertificate::decode(&der),
            None => Err(Error::EndOfData),
        }
    }

    pub fn get_membership_certificate(
        &self,
        subject: &PublicKey,
        guild: &Guid,
    ) -> Result<MembershipCertificate> {
        let der: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT der FROM membership_certs
                 WHERE subject_public_key = ?1 AND guild = ?2",
                params![subject.as_bytes().as_slice(), guild.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        match der {
            Some(der) => MembershipCertificate::decode(&der),
            None => Err(Error::EndOfData),
        }
    }

    pub fn get_membership_certificates(
        &self,
        subject: Option<&PublicKey>,
        guild: Option<&Guid>,
    ) -> Result<Vec<MembershipCertificate>> {
        let (sql, filter): (&str, Vec<Vec<u8>>) = match (subject, guild) {
            (Some(subject), Some(guild)) => (
                "SELECT der FROM membership_certs
                 WHERE subject_public_key = ?1 AND guild = ?2 ORDER BY serial",
                vec![subject.as_bytes().to_vec(), guild.as_bytes().to_vec()],
            ),
            (Some(subject), None) => (
                "SELECT der FROM membership_certs WHERE subject_public_key = ?1 ORDER BY serial",
                vec![subject.as_bytes().to_vec()],
            ),
            (None, Some(guild)) => (
                "SELECT der FROM membership_certs WHERE guild = ?1 ORDER BY serial",
                vec![guild.as_bytes().to_vec()],
            ),
            (None, None) => ("SELECT der FROM membership_certs ORDER BY serial", vec![]),
        };
        let mut stmt = self.conn.prepare(sql).map_err(storage_err)?;
        let ders = stmt
            .query_map(rusqlite::params_from_iter(filter.iter()), |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;
        ders.iter()
            .map(|der| MembershipCertificate::decode(der))
            .collect()
    }

    // ─── Policies & manifests ────────────────────────────────────────────

    pub fn store_policy(&self, key: &PublicKey, policy: &Policy) -> Result<()> {
        let bytes = policy.to_bytes()?;
        let updated = self
            .conn
            .execute(
                "UPDATE applications SET policy = ?2 WHERE public_key = ?1",
                params![key.as_bytes().as_slice(), bytes],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn get_policy(&self, key: &PublicKey) -> Result<Policy> {
        let bytes: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT policy FROM applications WHERE public_key = ?1",
                params![key.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        match bytes.flatten() {
            Some(bytes) => Policy::from_bytes(&bytes),
            None => Err(Error::EndOfData),
        }
    }

    pub fn store_manifest(&self, key: &PublicKey, manifest: &Manifest) -> Result<()> {
        let bytes = manifest.bytes()?;
        let updated = self
            .conn
            .execute(
                "UPDATE applications SET manifest = ?2 WHERE public_key = ?1",
                params![key.as_bytes().as_slice(), bytes],
            )
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn get_manifest(&self, key: &PublicKey) -> Result<Manifest> {
        let bytes: Option<Option<Vec<u8>>> = self
            .conn
            .query_row(
                "SELECT manifest FROM applications WHERE public_key = ?1",
                params![key.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        match bytes.flatten() {
            Some(bytes) => Manifest::from_bytes(&bytes),
            None => Err(Error::EndOfData),
        }
    }

    // ─── Groups & identities ─────────────────────────────────────────────

    pub fn store_group(&self, group: &GroupInfo) -> Result<()> {
        let authority = group.authority.ok_or(Error::KeyUnavailable)?;
        self.conn
            .execute(
                "INSERT INTO groups (authority, guid, name, descr) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(authority, guid) DO UPDATE SET name = ?3, descr = ?4",
                params![
                    authority.as_bytes().as_slice(),
                    group.guid.as_bytes().as_slice(),
                    group.name,
                    group.desc,
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn remove_group(&self, authority: &PublicKey, guid: &Guid) -> Result<()> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM groups WHERE authority = ?1 AND guid = ?2",
                params![authority.as_bytes().as_slice(), guid.as_bytes().as_slice()],
            )
            .map_err(storage_err)?;
        if removed == 0 {
            return Err(Error::EndOfData);
        }
        Ok(())
    }

    pub fn get_group(&self, authority: &PublicKey, guid: &Guid) -> Result<GroupInfo> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT name, descr FROM groups WHERE authority = ?1 AND guid = ?2",
                params![authority.as_bytes().as_slice(), guid.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err)?;
        let Some((name, desc)) = row else {
            return Err(Error::EndOfData);
        };
        Ok(GroupInfo { authority: Some(*authority), guid: *guid, name, desc })
    }

    pub fn get_groups(&self) -> Result<Vec<GroupInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT authority, guid, name, descr FROM groups")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        let mut groups = Vec::with_capacity(rows.len());
        for (authority, guid, name, desc) in rows {
            groups.push(GroupInfo {
                authority: Some(PublicKey::from_bytes(&authority)?),
                guid: Guid::from_bytes(&guid)?,
                name,
                desc,
            });
        }
        Ok(groups)
    }

    pub fn store_identity(&self, identity: &IdentityInfo) -> Result<()> {
        let authority = identity.authority.ok_or(Error::KeyUnavailable)?;
        self.conn
            .execute(
                "INSERT INTO identities (authority, guid, name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(authority, guid) DO UPDATE SET name = ?3",
                params![
                    authority.as_bytes().as_slice(),
                    identity.guid.as_bytes().as_slice(),
                    identity.name,
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    pub fn remove_identity(&self, authority: &PublicKey, guid: &Guid) -> Result<()> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM identities WHERE authority = ?1 AND guid = ?2",
                params![authority.as_bytes().as_slice(), guid.as_bytes().as_slice()],
            )
            .map_err(storage_err)?;
        if removed == 0 {
            return Err(Error::EndOfData);
        }
        Ok(())
    }

    pub fn get_identity(&self, authority: &PublicKey, guid: &Guid) -> Result<IdentityInfo> {
        let name: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM identities WHERE authority = ?1 AND guid = ?2",
                params![authority.as_bytes().as_slice(), guid.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_err)?;
        let Some(name) = name else {
            return Err(Error::EndOfData);
        };
        Ok(IdentityInfo { authority: Some(*authority), guid: *guid, name })
    }

    pub fn get_identities(&self) -> Result<Vec<IdentityInfo>> {
        let mut stmt = self
            .conn
            .prepare("SELECT authority, guid, name FROM identities")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(storage_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        let mut identities = Vec::with_capacity(rows.len());
        for (authority, guid, name) in rows {
            identities.push(IdentityInfo {
                authority: Some(PublicKey::from_bytes(&authority)?),
                guid: Guid::from_bytes(&guid)?,
                name,
            });
        }
        Ok(identities)
    }

    // ─── Serial counter ──────────────────────────────────────────────────

    pub fn get_new_serial(&self) -> Result<String> {
        let value: i64 = self
            .conn
            .query_row("SELECT value FROM serial_counter WHERE id = 0", [], |row| row.get(0))
            .map_err(storage_err)?;
        if value > i64::from(u32::MAX) {
            return Err(Error::SerialExhausted);
        }
        self.conn
            .execute("UPDATE serial_counter SET value = value + 1 WHERE id = 0", [])
            .map_err(storage_err)?;
        Ok(value.to_string())
    }
}
