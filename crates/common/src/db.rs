//! SQLite persistence for the PVE server / virtual machine inventory

use crate::types::{PveServer, VirtualMachine, VmStatus};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Database wrapper for inventory persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pve_servers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL DEFAULT 8006,
                token_id TEXT NOT NULL,
                token_secret TEXT NOT NULL,
                verify_ssl INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pve_servers_name ON pve_servers(name);

            CREATE TABLE IF NOT EXISTS virtual_machines (
                id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                vmid INTEGER NOT NULL,
                name TEXT NOT NULL,
                node TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'unknown',
                cpu_cores INTEGER NOT NULL DEFAULT 1,
                memory_mb INTEGER NOT NULL DEFAULT 512,
                disk_gb INTEGER NOT NULL DEFAULT 10,
                ip_address TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(server_id, vmid),
                FOREIGN KEY(server_id) REFERENCES pve_servers(id)
            );
            CREATE INDEX IF NOT EXISTS idx_virtual_machines_server ON virtual_machines(server_id);
            CREATE INDEX IF NOT EXISTS idx_virtual_machines_node ON virtual_machines(node);
            "#,
        )?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // PVE servers
    // ------------------------------------------------------------------

    pub fn insert_server(&self, server: &PveServer) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pve_servers
             (id, name, host, port, token_id, token_secret, verify_ssl, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                server.id,
                server.name,
                server.host,
                server.port,
                server.token_id,
                server.token_secret,
                server.verify_ssl,
                server.is_active,
                server.created_at,
                server.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_server(&self, id: &str) -> Result<Option<PveServer>> {
        let conn = self.conn.lock();
        let server = conn
            .query_row(
                "SELECT id, name, host, port, token_id, token_secret, verify_ssl, is_active,
                        created_at, updated_at
                 FROM pve_servers WHERE id = ?1",
                params![id],
                row_to_server,
            )
            .optional()?;
        Ok(server)
    }

    pub fn list_servers(&self) -> Result<Vec<PveServer>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, host, port, token_id, token_secret, verify_ssl, is_active,
                    created_at, updated_at
             FROM pve_servers ORDER BY name",
        )?;
        let servers = stmt
            .query_map([], row_to_server)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(servers)
    }

    pub fn delete_server(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM pve_servers WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::NotFound {
                kind: "server".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Virtual machines
    // ------------------------------------------------------------------

    pub fn insert_vm(&self, vm: &VirtualMachine) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO virtual_machines
             (id, server_id, vmid, name, node, status, cpu_cores, memory_mb, disk_gb,
              ip_address, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                vm.id,
                vm.server_id,
                vm.vmid,
                vm.name,
                vm.node,
                vm.status.as_str(),
                vm.cpu_cores,
                vm.memory_mb,
                vm.disk_gb,
                vm.ip_address,
                vm.description,
                vm.created_at,
                vm.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_vm(&self, id: &str) -> Result<Option<VirtualMachine>> {
        let conn = self.conn.lock();
        let vm = conn
            .query_row(
                "SELECT id, server_id, vmid, name, node, status, cpu_cores, memory_mb, disk_gb,
                        ip_address, description, created_at, updated_at
                 FROM virtual_machines WHERE id = ?1",
                params![id],
                row_to_vm,
            )
            .optional()?;
        Ok(vm)
    }

    pub fn list_vms(&self) -> Result<Vec<VirtualMachine>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, server_id, vmid, name, node, status, cpu_cores, memory_mb, disk_gb,
                    ip_address, description, created_at, updated_at
             FROM virtual_machines ORDER BY created_at DESC",
        )?;
        let vms = stmt
            .query_map([], row_to_vm)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(vms)
    }

    pub fn update_vm_status(&self, id: &str, status: VmStatus) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE virtual_machines SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), chrono::Utc::now().timestamp(), id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound {
                kind: "virtual machine".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_vm(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM virtual_machines WHERE id = ?1", params![id])?;
        if rows == 0 {
            return Err(Error::NotFound {
                kind: "virtual machine".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<PveServer> {
    Ok(PveServer {
        id: row.get(0)?,
        name: row.get(1)?,
        host: row.get(2)?,
        port: row.get(3)?,
        token_id: row.get(4)?,
        token_secret: row.get(5)?,
        verify_ssl: row.get(6)?,
        is_active: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn row_to_vm(row: &Row<'_>) -> rusqlite::Result<VirtualMachine> {
    let status: String = row.get(5)?;
    Ok(VirtualMachine {
        id: row.get(0)?,
        server_id: row.get(1)?,
        vmid: row.get(2)?,
        name: row.get(3)?,
        node: row.get(4)?,
        status: VmStatus::parse(&status),
        cpu_cores: row.get(6)?,
        memory_mb: row.get(7)?,
        disk_gb: row.get(8)?,
        ip_address: row.get(9)?,
        description: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}
