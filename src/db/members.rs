use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};

use super::*;
use crate::sync::reconcile::ProfileStore;
use crate::types::ProfileField;

const MEMBER_COLUMNS: &str = "id, firstname, lastname, email, company, jobtitle, phone,
     industry, state, city, bio, linkedin, headshot, membership, email_domain, active";

impl MemberDb {
    // =========================================================================
    // Members
    // =========================================================================

    /// Look up a member by id. A missing member is `Ok(None)`.
    pub fn get_member(&self, id: &str) -> Result<Option<LocalProfile>, DbError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1");
        let member = self
            .conn
            .query_row(&sql, params![id], Self::map_member_row)
            .optional()?;
        Ok(member)
    }

    /// Insert or replace a member keyed by id. Returns true if the row is new.
    pub fn upsert_member(&self, member: &LocalProfile) -> Result<bool, DbError> {
        let existed: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM members WHERE id = ?1)",
            params![member.id],
            |row| row.get(0),
        )?;

        self.conn.execute(
            "INSERT INTO members (
                id, firstname, lastname, email, company, jobtitle, phone, industry,
                state, city, bio, linkedin, headshot, membership, email_domain, active,
                synced_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                       datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                firstname = excluded.firstname,
                lastname = excluded.lastname,
                email = excluded.email,
                company = excluded.company,
                jobtitle = excluded.jobtitle,
                phone = excluded.phone,
                industry = excluded.industry,
                state = excluded.state,
                city = excluded.city,
                bio = excluded.bio,
                linkedin = excluded.linkedin,
                headshot = excluded.headshot,
                membership = excluded.membership,
                email_domain = excluded.email_domain,
                active = excluded.active,
                synced_at = excluded.synced_at",
            params![
                member.id,
                member.firstname,
                member.lastname,
                member.email,
                member.company,
                member.jobtitle,
                member.phone,
                member.industry,
                member.state,
                member.city,
                member.bio,
                member.linkedin,
                member.headshot,
                member.membership,
                member.email_domain,
                member.active,
            ],
        )?;
        Ok(!existed)
    }

    /// Apply a partial update. Returns false when no member has this id.
    pub fn update_member_fields(&self, id: &str, patch: &ProfilePatch) -> Result<bool, DbError> {
        if patch.is_empty() {
            return Ok(self.get_member(id)?.is_some());
        }

        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        for (field, value) in &patch.fields {
            values.push(Value::Text(value.clone()));
            sets.push(format!("{} = ?{}", field.property(), values.len()));
        }
        if let Some(domain) = &patch.email_domain {
            values.push(match domain {
                Some(d) => Value::Text(d.clone()),
                None => Value::Null,
            });
            sets.push(format!("email_domain = ?{}", values.len()));
        }
        if let Some(active) = patch.active {
            values.push(Value::Integer(i64::from(active)));
            sets.push(format!("active = ?{}", values.len()));
        }

        values.push(Value::Text(id.to_string()));
        let sql = format!(
            "UPDATE members SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );
        let changed = self.conn.execute(&sql, params_from_iter(values))?;
        Ok(changed > 0)
    }

    /// Total and active member counts.
    pub fn count_members(&self) -> Result<(i64, i64), DbError> {
        let counts = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(active), 0) FROM members",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }

    fn map_member_row(row: &rusqlite::Row) -> rusqlite::Result<LocalProfile> {
        let mut member = LocalProfile {
            id: row.get(0)?,
            email_domain: row.get(14)?,
            active: row.get(15)?,
            ..LocalProfile::default()
        };
        for (i, field) in ProfileField::ALL.iter().enumerate() {
            *member.field_mut(*field) = row.get(i + 1)?;
        }
        Ok(member)
    }
}

impl ProfileStore for MemberDb {
    fn get_profile(&self, id: &str) -> Result<Option<LocalProfile>, DbError> {
        self.get_member(id)
    }

    fn upsert_profile(&self, profile: &LocalProfile) -> Result<bool, DbError> {
        self.upsert_member(profile)
    }

    fn update_profile_fields(&self, id: &str, patch: &ProfilePatch) -> Result<bool, DbError> {
        self.update_member_fields(id, patch)
    }
}
