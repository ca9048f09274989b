// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Schema fingerprinting.

use rusqlite::Connection;
use sha2::{Digest, Sha256};

/// SHA-256 (hex) over every `sqlite_master` row, ordered by type and name.
///
/// Two databases with the same tables, indexes, views and triggers produce
/// the same fingerprint regardless of their data.
pub fn schema_fingerprint(conn: &Connection) -> rusqlite::Result<String> {
    let mut stmt = conn.prepare(
        "SELECT type, name, tbl_name, COALESCE(sql, '') FROM sqlite_master \
         WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
    )?;
    let mut rows = stmt.query([])?;

    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        for i in 0..4 {
            let field: String = row.get(i)?;
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}
