use crate::error::{Result, StoreError};
use crate::schema;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use smsdesk::protocol::{
    Category, Contact, Direction, Message, PhoneNumber, Role, UpdateContactRequest, User, is_e164,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const USER_COLUMNS: &str = "id, name, role, admin_id";
const PHONE_COLUMNS: &str = "id, admin_id, phone_number, assigned_to, active, purchased_at";
const CONTACT_COLUMNS: &str = "id, phone_number_id, phone_number, name, last_message, \
     last_message_time, unread_count, is_pinned, category";
const MESSAGE_COLUMNS: &str =
    "id, phone_number_id, from_number, to_number, body, direction, timestamp, sid";

/// A phone number to seed or refresh.
#[derive(Debug, Clone)]
pub struct NewPhoneNumber {
    pub id: String,
    pub admin_id: String,
    pub phone_number: String,
    pub active: bool,
}

/// A message about to be appended to a phone number's log.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub phone_number_id: String,
    /// The other party's E.164 number.
    pub counterpart: String,
    pub body: String,
    pub direction: Direction,
    /// Carrier message id, used to detect redelivery.
    pub sid: Option<String>,
}

/// Outcome of [`MessageStore::record_message`].
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub message: Message,
    pub contact: Contact,
    /// True when `sid` was already recorded; nothing was written.
    pub duplicate: bool,
}

/// The message store. One SQLite connection guarded by a std mutex; async callers
/// go through `spawn_blocking`.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Invalid(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        // WAL mode for concurrent reads while the webhook writes
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        schema::migrate(&conn)?;
        let messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        if messages > 0 {
            tracing::info!(messages, "loaded message store from disk");
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Liveness check for `/health`.
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Insert or refresh a user and its bearer token.
    pub fn upsert_user(&self, user: &User, token: &str) -> Result<()> {
        if token.is_empty() {
            return Err(StoreError::Invalid(format!("user {} has no token", user.id)));
        }
        if user.role == Role::Member && user.admin_id.is_none() {
            return Err(StoreError::Invalid(format!(
                "member {} must belong to an admin",
                user.id
            )));
        }
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (id, name, role, admin_id, token) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, role = excluded.role,
                admin_id = excluded.admin_id, token = excluded.token",
            params![user.id, user.name, user.role.as_str(), user.admin_id, token],
        )
        .map_err(|e| unique_to_conflict(e, "token already in use"))?;
        Ok(())
    }

    pub fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE token = ?1"),
                [token],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn user(&self, id: &str) -> Result<User> {
        let conn = self.lock()?;
        find_user(&conn, id)?.ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    // -----------------------------------------------------------------------
    // Phone numbers
    // -----------------------------------------------------------------------

    pub fn upsert_phone_number(&self, new: &NewPhoneNumber) -> Result<PhoneNumber> {
        if !is_e164(&new.phone_number) {
            return Err(StoreError::Invalid(format!(
                "{} is not an E.164 number",
                new.phone_number
            )));
        }
        let conn = self.lock()?;
        match find_user(&conn, &new.admin_id)? {
            Some(owner) if owner.role == Role::Admin => {}
            Some(_) => {
                return Err(StoreError::Invalid(format!(
                    "{} is not an admin",
                    new.admin_id
                )));
            }
            None => return Err(StoreError::NotFound(format!("user {}", new.admin_id))),
        }
        conn.execute(
            "INSERT INTO phone_numbers (id, admin_id, phone_number, active, purchased_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                admin_id = excluded.admin_id,
                phone_number = excluded.phone_number,
                active = excluded.active",
            params![
                new.id,
                new.admin_id,
                new.phone_number,
                new.active,
                format_ts(&Utc::now())
            ],
        )
        .map_err(|e| unique_to_conflict(e, "phone number already registered"))?;
        get_phone_number(&conn, &new.id)
    }

    pub fn phone_number(&self, id: &str) -> Result<PhoneNumber> {
        let conn = self.lock()?;
        get_phone_number(&conn, id)
    }

    /// Resolve the number a carrier delivered to.
    pub fn phone_number_by_e164(&self, number: &str) -> Result<Option<PhoneNumber>> {
        let conn = self.lock()?;
        let phone = conn
            .query_row(
                &format!("SELECT {PHONE_COLUMNS} FROM phone_numbers WHERE phone_number = ?1"),
                [number],
                phone_from_row,
            )
            .optional()?;
        Ok(phone)
    }

    /// Numbers the user may work on: owned ones for admins, the active assigned
    /// ones for members.
    pub fn phone_numbers_for(&self, user: &User) -> Result<Vec<PhoneNumber>> {
        let conn = self.lock()?;
        let sql = match user.role {
            Role::Admin => format!(
                "SELECT {PHONE_COLUMNS} FROM phone_numbers WHERE admin_id = ?1 \
                 ORDER BY purchased_at, id"
            ),
            Role::Member => format!(
                "SELECT {PHONE_COLUMNS} FROM phone_numbers WHERE assigned_to = ?1 AND active = 1 \
                 ORDER BY purchased_at, id"
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([&user.id], phone_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Assign a number to a member of the owning admin's team, replacing any
    /// previous assignee.
    pub fn assign(&self, phone_number_id: &str, user_id: &str) -> Result<PhoneNumber> {
        let conn = self.lock()?;
        let phone = get_phone_number(&conn, phone_number_id)?;
        let member =
            find_user(&conn, user_id)?.ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        if member.role != Role::Member {
            return Err(StoreError::Invalid(format!("{user_id} is not a member")));
        }
        if member.admin_id.as_deref() != Some(phone.admin_id.as_str()) {
            return Err(StoreError::Invalid(format!(
                "{user_id} does not belong to the owner of {}",
                phone.phone_number
            )));
        }
        conn.execute(
            "UPDATE phone_numbers SET assigned_to = ?2 WHERE id = ?1",
            params![phone_number_id, user_id],
        )?;
        tracing::info!(phone = %phone.phone_number, user = user_id, "phone number assigned");
        get_phone_number(&conn, phone_number_id)
    }

    pub fn unassign(&self, phone_number_id: &str) -> Result<PhoneNumber> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE phone_numbers SET assigned_to = NULL WHERE id = ?1",
            [phone_number_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("phone number {phone_number_id}")));
        }
        get_phone_number(&conn, phone_number_id)
    }

    // -----------------------------------------------------------------------
    // Contacts
    // -----------------------------------------------------------------------

    /// Contacts of a number, pinned first, then most recent activity.
    pub fn contacts(&self, phone_number_id: &str) -> Result<Vec<Contact>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone_number_id = ?1
             ORDER BY is_pinned DESC, COALESCE(last_message_time, '') DESC, id"
        ))?;
        let rows = stmt.query_map([phone_number_id], contact_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn contact(&self, id: &str) -> Result<Contact> {
        let conn = self.lock()?;
        get_contact(&conn, id)
    }

    pub fn contact_by_number(&self, phone_number_id: &str, number: &str) -> Result<Option<Contact>> {
        let conn = self.lock()?;
        Ok(find_contact_by_number(&conn, phone_number_id, number)?)
    }

    /// Explicitly create a contact. A second contact for the same counterpart
    /// on the same number is a conflict.
    pub fn create_contact(
        &self,
        phone_number_id: &str,
        number: &str,
        name: Option<&str>,
    ) -> Result<Contact> {
        if !is_e164(number) {
            return Err(StoreError::Invalid(format!("{number} is not an E.164 number")));
        }
        let conn = self.lock()?;
        get_phone_number(&conn, phone_number_id)?;
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO contacts (id, phone_number_id, phone_number, name) VALUES (?1, ?2, ?3, ?4)",
            params![id, phone_number_id, number, normalize_name(name)],
        )
        .map_err(|e| unique_to_conflict(e, &format!("contact {number} already exists")))?;
        get_contact(&conn, &id)
    }

    /// Apply a partial update. An empty name clears it.
    pub fn update_contact(&self, id: &str, patch: &UpdateContactRequest) -> Result<Contact> {
        if patch.is_empty() {
            return Err(StoreError::Invalid("nothing to update".to_string()));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        get_contact(&tx, id)?;
        if let Some(name) = &patch.name {
            tx.execute(
                "UPDATE contacts SET name = ?2 WHERE id = ?1",
                params![id, normalize_name(Some(name))],
            )?;
        }
        if let Some(pinned) = patch.is_pinned {
            tx.execute(
                "UPDATE contacts SET is_pinned = ?2 WHERE id = ?1",
                params![id, pinned],
            )?;
        }
        if let Some(category) = patch.category {
            tx.execute(
                "UPDATE contacts SET category = ?2 WHERE id = ?1",
                params![id, category.as_str()],
            )?;
        }
        let contact = get_contact(&tx, id)?;
        tx.commit()?;
        Ok(contact)
    }

    /// Delete a contact together with its conversation. Returns the removed contact.
    pub fn delete_contact(&self, id: &str) -> Result<Contact> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let contact = get_contact(&tx, id)?;
        let removed = tx.execute(
            "DELETE FROM messages WHERE phone_number_id = ?1
                AND (from_number = ?2 OR to_number = ?2)",
            params![contact.phone_number_id, contact.phone_number],
        )?;
        tx.execute("DELETE FROM contacts WHERE id = ?1", [id])?;
        tx.commit()?;
        tracing::debug!(contact = id, messages = removed, "contact deleted");
        Ok(contact)
    }

    pub fn mark_read(&self, id: &str) -> Result<Contact> {
        let conn = self.lock()?;
        let changed = conn.execute("UPDATE contacts SET unread_count = 0 WHERE id = ?1", [id])?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("contact {id}")));
        }
        get_contact(&conn, id)
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Messages exchanged with a contact, oldest first.
    pub fn conversation(&self, contact_id: &str) -> Result<Vec<Message>> {
        let conn = self.lock()?;
        let contact = get_contact(&conn, contact_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE phone_number_id = ?1 AND (from_number = ?2 OR to_number = ?2)
             ORDER BY timestamp, seq"
        ))?;
        let rows = stmt.query_map(
            params![contact.phone_number_id, contact.phone_number],
            message_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn message_count(&self, phone_number_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE phone_number_id = ?1",
            [phone_number_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Append a message and upsert the counterpart's contact in one transaction.
    ///
    /// Inbound messages bump `unread_count`; outbound ones only refresh the
    /// preview. A `sid` already recorded for the number is reported as a
    /// duplicate without writing anything.
    pub fn record_message(&self, new: NewMessage) -> Result<RecordedMessage> {
        if !is_e164(&new.counterpart) {
            return Err(StoreError::Invalid(format!(
                "{} is not an E.164 number",
                new.counterpart
            )));
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let phone = get_phone_number(&tx, &new.phone_number_id)?;

        if let Some(sid) = &new.sid
            && let Some(existing) = find_message_by_sid(&tx, &phone.id, sid)?
        {
            let contact = find_contact_by_number(&tx, &phone.id, existing.counterpart())?
                .ok_or_else(|| StoreError::NotFound(format!("contact {}", existing.counterpart())))?;
            tracing::debug!(sid, phone = %phone.phone_number, "duplicate delivery ignored");
            return Ok(RecordedMessage {
                message: existing,
                contact,
                duplicate: true,
            });
        }

        let (from, to) = match new.direction {
            Direction::Inbound => (new.counterpart.clone(), phone.phone_number.clone()),
            Direction::Outbound => (phone.phone_number.clone(), new.counterpart.clone()),
        };
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            phone_number_id: phone.id.clone(),
            from,
            to,
            body: new.body,
            direction: new.direction,
            timestamp: Utc::now().trunc_subsecs(6),
            sid: new.sid,
        };
        insert_message(&tx, &message)?;
        let contact = upsert_contact_activity(&tx, &message)?;
        tx.commit()?;

        Ok(RecordedMessage {
            message,
            contact,
            duplicate: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn insert_message(tx: &Transaction<'_>, message: &Message) -> Result<()> {
    tx.execute(
        "INSERT INTO messages (id, phone_number_id, from_number, to_number, body, direction, timestamp, sid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            message.id,
            message.phone_number_id,
            message.from,
            message.to,
            message.body,
            message.direction.as_str(),
            format_ts(&message.timestamp),
            message.sid,
        ],
    )?;
    Ok(())
}

fn upsert_contact_activity(tx: &Transaction<'_>, message: &Message) -> Result<Contact> {
    let unread_delta: u32 = match message.direction {
        Direction::Inbound => 1,
        Direction::Outbound => 0,
    };
    let counterpart = message.counterpart();
    tx.execute(
        "INSERT INTO contacts (id, phone_number_id, phone_number, last_message, last_message_time, unread_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(phone_number_id, phone_number) DO UPDATE SET
            last_message = excluded.last_message,
            last_message_time = excluded.last_message_time,
            unread_count = contacts.unread_count + excluded.unread_count",
        params![
            uuid::Uuid::new_v4().to_string(),
            message.phone_number_id,
            counterpart,
            message.body,
            format_ts(&message.timestamp),
            unread_delta,
        ],
    )?;
    find_contact_by_number(tx, &message.phone_number_id, counterpart)?
        .ok_or_else(|| StoreError::NotFound(format!("contact {counterpart}")))
}

fn find_user(conn: &Connection, id: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [id],
        user_from_row,
    )
    .optional()
}

fn get_phone_number(conn: &Connection, id: &str) -> Result<PhoneNumber> {
    conn.query_row(
        &format!("SELECT {PHONE_COLUMNS} FROM phone_numbers WHERE id = ?1"),
        [id],
        phone_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("phone number {id}")))
}

fn get_contact(conn: &Connection, id: &str) -> Result<Contact> {
    conn.query_row(
        &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = ?1"),
        [id],
        contact_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("contact {id}")))
}

fn find_contact_by_number(
    conn: &Connection,
    phone_number_id: &str,
    number: &str,
) -> rusqlite::Result<Option<Contact>> {
    conn.query_row(
        &format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone_number_id = ?1 AND phone_number = ?2"
        ),
        [phone_number_id, number],
        contact_from_row,
    )
    .optional()
}

fn find_message_by_sid(
    conn: &Connection,
    phone_number_id: &str,
    sid: &str,
) -> rusqlite::Result<Option<Message>> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE phone_number_id = ?1 AND sid = ?2"),
        [phone_number_id, sid],
        message_from_row,
    )
    .optional()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        name: row.get(1)?,
        role: parse_text(2, row.get(2)?)?,
        admin_id: row.get(3)?,
    })
}

fn phone_from_row(row: &Row<'_>) -> rusqlite::Result<PhoneNumber> {
    Ok(PhoneNumber {
        id: row.get(0)?,
        admin_id: row.get(1)?,
        phone_number: row.get(2)?,
        assigned_to: row.get(3)?,
        active: row.get(4)?,
        purchased_at: parse_ts(5, row.get(5)?)?,
    })
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    let last_message_time: Option<String> = row.get(5)?;
    let category: Category = parse_text(8, row.get(8)?)?;
    Ok(Contact {
        id: row.get(0)?,
        phone_number_id: row.get(1)?,
        phone_number: row.get(2)?,
        name: row.get(3)?,
        last_message: row.get(4)?,
        last_message_time: last_message_time.map(|raw| parse_ts(5, raw)).transpose()?,
        unread_count: row.get(6)?,
        is_pinned: row.get(7)?,
        category,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        phone_number_id: row.get(1)?,
        from: row.get(2)?,
        to: row.get(3)?,
        body: row.get(4)?,
        direction: parse_text(5, row.get(5)?)?,
        timestamp: parse_ts(6, row.get(6)?)?,
        sid: row.get(7)?,
    })
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_text<T: std::str::FromStr<Err = String>>(idx: usize, raw: String) -> rusqlite::Result<T> {
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
}

fn unique_to_conflict(err: rusqlite::Error, message: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StoreError::Conflict(message.to_string())
        }
        _ => StoreError::Database(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN: &str = "admin-1";
    const MEMBER: &str = "member-1";
    const OWNED: &str = "+15550000001";
    const ALICE: &str = "+15551230001";
    const BOB: &str = "+15551230002";

    fn admin() -> User {
        User {
            id: ADMIN.to_string(),
            name: "Ada".to_string(),
            role: Role::Admin,
            admin_id: None,
        }
    }

    fn member() -> User {
        User {
            id: MEMBER.to_string(),
            name: "Mo".to_string(),
            role: Role::Member,
            admin_id: Some(ADMIN.to_string()),
        }
    }

    fn seeded() -> (MessageStore, PhoneNumber) {
        let store = MessageStore::open_in_memory().unwrap();
        store.upsert_user(&admin(), "admin-token").unwrap();
        store.upsert_user(&member(), "member-token").unwrap();
        let phone = store
            .upsert_phone_number(&NewPhoneNumber {
                id: "pn-1".to_string(),
                admin_id: ADMIN.to_string(),
                phone_number: OWNED.to_string(),
                active: true,
            })
            .unwrap();
        (store, phone)
    }

    fn inbound(phone: &PhoneNumber, from: &str, body: &str, sid: &str) -> NewMessage {
        NewMessage {
            phone_number_id: phone.id.clone(),
            counterpart: from.to_string(),
            body: body.to_string(),
            direction: Direction::Inbound,
            sid: Some(sid.to_string()),
        }
    }

    fn outbound(phone: &PhoneNumber, to: &str, body: &str) -> NewMessage {
        NewMessage {
            phone_number_id: phone.id.clone(),
            counterpart: to.to_string(),
            body: body.to_string(),
            direction: Direction::Outbound,
            sid: None,
        }
    }

    #[test]
    fn token_lookup() {
        let (store, _) = seeded();
        let user = store.user_by_token("member-token").unwrap().unwrap();
        assert_eq!(user, member());
        assert!(store.user_by_token("nope").unwrap().is_none());
    }

    #[test]
    fn member_without_admin_rejected() {
        let store = MessageStore::open_in_memory().unwrap();
        let mut orphan = member();
        orphan.admin_id = None;
        let err = store.upsert_user(&orphan, "t").unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn inbound_creates_contact_with_one_unread() {
        let (store, phone) = seeded();
        let recorded = store
            .record_message(inbound(&phone, ALICE, "hi", "SM1"))
            .unwrap();
        assert!(!recorded.duplicate);
        assert_eq!(recorded.message.from, ALICE);
        assert_eq!(recorded.message.to, OWNED);
        assert_eq!(recorded.contact.phone_number, ALICE);
        assert_eq!(recorded.contact.unread_count, 1);
        assert_eq!(recorded.contact.last_message.as_deref(), Some("hi"));
        assert_eq!(
            recorded.contact.last_message_time,
            Some(recorded.message.timestamp)
        );
    }

    #[test]
    fn inbound_increments_existing_contact() {
        let (store, phone) = seeded();
        store.record_message(inbound(&phone, ALICE, "one", "SM1")).unwrap();
        let second = store.record_message(inbound(&phone, ALICE, "two", "SM2")).unwrap();
        assert_eq!(second.contact.unread_count, 2);
        assert_eq!(second.contact.last_message.as_deref(), Some("two"));
        assert_eq!(store.contacts(&phone.id).unwrap().len(), 1);
    }

    #[test]
    fn duplicate_sid_is_not_recorded_twice() {
        let (store, phone) = seeded();
        let first = store.record_message(inbound(&phone, ALICE, "hi", "SM1")).unwrap();
        let again = store.record_message(inbound(&phone, ALICE, "hi", "SM1")).unwrap();
        assert!(again.duplicate);
        assert_eq!(again.message.id, first.message.id);
        assert_eq!(again.contact.unread_count, 1);
        assert_eq!(store.message_count(&phone.id).unwrap(), 1);
    }

    #[test]
    fn outbound_creates_contact_without_unread() {
        let (store, phone) = seeded();
        let recorded = store.record_message(outbound(&phone, BOB, "hello")).unwrap();
        assert_eq!(recorded.message.from, OWNED);
        assert_eq!(recorded.message.to, BOB);
        assert_eq!(recorded.contact.unread_count, 0);
        assert_eq!(recorded.contact.last_message.as_deref(), Some("hello"));
    }

    #[test]
    fn mark_read_resets_unread() {
        let (store, phone) = seeded();
        let recorded = store.record_message(inbound(&phone, ALICE, "hi", "SM1")).unwrap();
        let contact = store.mark_read(&recorded.contact.id).unwrap();
        assert_eq!(contact.unread_count, 0);
        assert!(matches!(store.mark_read("missing"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn conversation_is_ordered_and_scoped_to_counterpart() {
        let (store, phone) = seeded();
        store.record_message(inbound(&phone, ALICE, "a1", "SM1")).unwrap();
        store.record_message(inbound(&phone, BOB, "b1", "SM2")).unwrap();
        store.record_message(outbound(&phone, ALICE, "a2")).unwrap();
        let alice = store.contact_by_number(&phone.id, ALICE).unwrap().unwrap();
        let bodies: Vec<String> = store
            .conversation(&alice.id)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["a1", "a2"]);
    }

    #[test]
    fn refetch_is_idempotent() {
        let (store, phone) = seeded();
        store.record_message(inbound(&phone, ALICE, "a1", "SM1")).unwrap();
        let contact = store.contact_by_number(&phone.id, ALICE).unwrap().unwrap();
        assert_eq!(store.contacts(&phone.id).unwrap(), store.contacts(&phone.id).unwrap());
        assert_eq!(
            store.conversation(&contact.id).unwrap(),
            store.conversation(&contact.id).unwrap()
        );
    }

    #[test]
    fn duplicate_contact_is_conflict() {
        let (store, phone) = seeded();
        store.create_contact(&phone.id, ALICE, Some("Alice")).unwrap();
        let err = store.create_contact(&phone.id, ALICE, None).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[test]
    fn create_contact_validates_number() {
        let (store, phone) = seeded();
        let err = store.create_contact(&phone.id, "555", None).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        let err = store.create_contact("pn-missing", ALICE, None).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn contacts_sorted_pinned_then_recent() {
        let (store, phone) = seeded();
        let quiet = store.create_contact(&phone.id, BOB, Some("Bob")).unwrap();
        store.record_message(inbound(&phone, ALICE, "old", "SM1")).unwrap();
        store.record_message(inbound(&phone, "+15551230003", "new", "SM2")).unwrap();

        let numbers: Vec<String> = store
            .contacts(&phone.id)
            .unwrap()
            .into_iter()
            .map(|c| c.phone_number)
            .collect();
        assert_eq!(numbers, vec!["+15551230003", ALICE, BOB]);

        store
            .update_contact(
                &quiet.id,
                &UpdateContactRequest {
                    is_pinned: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        let first = store.contacts(&phone.id).unwrap().remove(0);
        assert_eq!(first.phone_number, BOB);
        assert!(first.is_pinned);
    }

    #[test]
    fn update_contact_fields() {
        let (store, phone) = seeded();
        let contact = store.create_contact(&phone.id, ALICE, Some("Alice")).unwrap();
        let updated = store
            .update_contact(
                &contact.id,
                &UpdateContactRequest {
                    name: Some("  ".to_string()),
                    category: Some(Category::Sales),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.name, None);
        assert_eq!(updated.category, Category::Sales);
        assert!(matches!(
            store.update_contact(&contact.id, &UpdateContactRequest::default()),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn delete_contact_cascades_messages() {
        let (store, phone) = seeded();
        store.record_message(inbound(&phone, ALICE, "a", "SM1")).unwrap();
        store.record_message(inbound(&phone, BOB, "b", "SM2")).unwrap();
        let alice = store.contact_by_number(&phone.id, ALICE).unwrap().unwrap();

        store.delete_contact(&alice.id).unwrap();
        assert!(matches!(store.contact(&alice.id), Err(StoreError::NotFound(_))));
        assert_eq!(store.message_count(&phone.id).unwrap(), 1);

        // a later message recreates the contact from scratch
        let again = store.record_message(inbound(&phone, ALICE, "back", "SM3")).unwrap();
        assert_eq!(again.contact.unread_count, 1);
        assert_ne!(again.contact.id, alice.id);
    }

    #[test]
    fn phone_numbers_visible_by_role() {
        let (store, phone) = seeded();
        assert_eq!(store.phone_numbers_for(&admin()).unwrap().len(), 1);
        assert!(store.phone_numbers_for(&member()).unwrap().is_empty());

        let assigned = store.assign(&phone.id, MEMBER).unwrap();
        assert_eq!(assigned.assigned_to.as_deref(), Some(MEMBER));
        assert!(assigned.accessible_by(&member()));
        assert_eq!(store.phone_numbers_for(&member()).unwrap().len(), 1);

        store.unassign(&phone.id).unwrap();
        assert!(store.phone_numbers_for(&member()).unwrap().is_empty());
    }

    #[test]
    fn assign_requires_member_of_same_admin() {
        let (store, phone) = seeded();
        let other_admin = User {
            id: "admin-2".to_string(),
            name: "Other".to_string(),
            role: Role::Admin,
            admin_id: None,
        };
        let stranger = User {
            id: "member-2".to_string(),
            name: "Stranger".to_string(),
            role: Role::Member,
            admin_id: Some("admin-2".to_string()),
        };
        store.upsert_user(&other_admin, "t2").unwrap();
        store.upsert_user(&stranger, "t3").unwrap();

        assert!(matches!(store.assign(&phone.id, "member-2"), Err(StoreError::Invalid(_))));
        assert!(matches!(store.assign(&phone.id, ADMIN), Err(StoreError::Invalid(_))));
        assert!(matches!(store.assign(&phone.id, "ghost"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn resolve_phone_by_e164() {
        let (store, phone) = seeded();
        assert_eq!(store.phone_number_by_e164(OWNED).unwrap(), Some(phone));
        assert_eq!(store.phone_number_by_e164("+19999999999").unwrap(), None);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smsdesk.db");
        {
            let store = MessageStore::open(&path).unwrap();
            store.upsert_user(&admin(), "admin-token").unwrap();
            store
                .upsert_phone_number(&NewPhoneNumber {
                    id: "pn-1".to_string(),
                    admin_id: ADMIN.to_string(),
                    phone_number: OWNED.to_string(),
                    active: true,
                })
                .unwrap();
            let phone = store.phone_number("pn-1").unwrap();
            store.record_message(inbound(&phone, ALICE, "hi", "SM1")).unwrap();
        }
        let store = MessageStore::open(&path).unwrap();
        assert_eq!(store.message_count("pn-1").unwrap(), 1);
        assert_eq!(store.contacts("pn-1").unwrap()[0].unread_count, 1);
    }
}
