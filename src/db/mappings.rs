use std::collections::BTreeMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::*;

impl MemberDb {
    // =========================================================================
    // Discovered field mappings
    // =========================================================================

    /// Replace the stored mapping for `list_id`.
    pub fn save_field_mapping(
        &self,
        list_id: u64,
        list_name: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<(), DbError> {
        let list_id = list_id as i64;
        self.with_transaction(|db| {
            db.conn.execute(
                "INSERT INTO crm_lists (list_id, list_name, mapped_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(list_id) DO UPDATE SET
                    list_name = excluded.list_name,
                    mapped_at = excluded.mapped_at",
                params![list_id, list_name, Utc::now().to_rfc3339()],
            )?;
            db.conn.execute(
                "DELETE FROM list_field_mappings WHERE list_id = ?1",
                params![list_id],
            )?;
            for (local_field, property_name) in properties {
                db.conn.execute(
                    "INSERT INTO list_field_mappings (list_id, local_field, property_name)
                     VALUES (?1, ?2, ?3)",
                    params![list_id, local_field, property_name],
                )?;
            }
            Ok(())
        })
    }

    /// The stored mapping for `list_id`, if a connection test has run for it.
    pub fn get_field_mapping(&self, list_id: u64) -> Result<Option<DbFieldMapping>, DbError> {
        let list_id = list_id as i64;
        let header: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT list_name, mapped_at FROM crm_lists WHERE list_id = ?1",
                params![list_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((list_name, mapped_at)) = header else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT local_field, property_name FROM list_field_mappings WHERE list_id = ?1",
        )?;
        let rows = stmt.query_map(params![list_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut properties = BTreeMap::new();
        for row in rows {
            let (local, property) = row?;
            properties.insert(local, property);
        }

        Ok(Some(DbFieldMapping {
            list_id,
            list_name,
            mapped_at,
            properties,
        }))
    }
}
