//! sled-backed repository.
//!
//! Each entity lives in its own tree as a JSON value keyed by its
//! big-endian id. Two index trees sit beside them:
//! - `users_by_email`: lowercase email -> user id, for unique logins
//! - `open_tickets`: (customer_id, course_id) -> id of the one open ticket
//!
//! Generic CRUD is plain tree access. Writes that must land together go
//! through a sled transaction ([`Storage::create_user`],
//! [`Storage::ticket_transaction`]).

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Transactional, Tree};

use crate::error::StorageError;
use crate::models::{Record, Ticket, User, Visit};

/// A row type stored in its own tree.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + 'static {
    const TREE: &'static str;

    fn record(&self) -> &Record;
    fn record_mut(&mut self) -> &mut Record;

    fn id(&self) -> u64 {
        self.record().id
    }

    fn is_deleted(&self) -> bool {
        self.record().deleted_at.is_some()
    }
}

/// Result type for closures run inside a ticket transaction.
pub type TxResult<T> = ConflictableTransactionResult<T, StorageError>;

#[derive(Clone)]
pub struct Storage {
    db: Db,
    users: Tree,
    users_by_email: Tree,
    tickets: Tree,
    visits: Tree,
    open_tickets: Tree,
}

impl Storage {
    /// Open or create the sled database at the given path.
    pub fn open(path: &str) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database, discarded on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        Ok(Self {
            users: db.open_tree(User::TREE)?,
            users_by_email: db.open_tree("users_by_email")?,
            tickets: db.open_tree(Ticket::TREE)?,
            visits: db.open_tree(Visit::TREE)?,
            open_tickets: db.open_tree("open_tickets")?,
            db,
        })
    }

    /// Block until all pending writes are on disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn tree<E: Entity>(&self) -> Result<Tree, StorageError> {
        Ok(self.db.open_tree(E::TREE)?)
    }

    fn next_id(&self) -> Result<u64, StorageError> {
        // generate_id starts at 0; 0 is reserved for "not yet stored".
        Ok(self.db.generate_id()? + 1)
    }

    /// Insert a new row, assigning id and timestamps.
    pub fn create<E: Entity>(&self, mut entity: E) -> Result<E, StorageError> {
        stamp_new(entity.record_mut(), self.next_id()?);
        self.tree::<E>()?
            .insert(key(entity.id()), serde_json::to_vec(&entity)?)?;
        Ok(entity)
    }

    /// Live row by id; soft-deleted rows read as absent.
    pub fn find_by_id<E: Entity>(&self, id: u64) -> Result<Option<E>, StorageError> {
        match self.tree::<E>()?.get(key(id))? {
            Some(bytes) => {
                let entity: E = serde_json::from_slice(&bytes)?;
                Ok((!entity.is_deleted()).then_some(entity))
            }
            None => Ok(None),
        }
    }

    /// First live row (in id order) matching `predicate`.
    pub fn find_one<E, F>(&self, predicate: F) -> Result<Option<E>, StorageError>
    where
        E: Entity,
        F: Fn(&E) -> bool,
    {
        for item in self.tree::<E>()?.iter() {
            let (_, value) = item?;
            let entity: E = serde_json::from_slice(&value)?;
            if !entity.is_deleted() && predicate(&entity) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    /// All live rows matching `predicate`, in id order.
    pub fn list_where<E, F>(&self, predicate: F) -> Result<Vec<E>, StorageError>
    where
        E: Entity,
        F: Fn(&E) -> bool,
    {
        let mut rows = vec![];
        for item in self.tree::<E>()?.iter() {
            let (_, value) = item?;
            let entity: E = serde_json::from_slice(&value)?;
            if !entity.is_deleted() && predicate(&entity) {
                rows.push(entity);
            }
        }
        Ok(rows)
    }

    pub fn list<E: Entity>(&self) -> Result<Vec<E>, StorageError> {
        self.list_where(|_: &E| true)
    }

    /// Overwrite an existing live row.
    pub fn update<E: Entity>(&self, entity: &mut E) -> Result<(), StorageError> {
        let id = entity.id();
        if self.find_by_id::<E>(id)?.is_none() {
            return Err(StorageError::NotFound {
                entity: E::TREE,
                id,
            });
        }
        entity.record_mut().updated_at = Utc::now();
        self.tree::<E>()?.insert(key(id), serde_json::to_vec(entity)?)?;
        Ok(())
    }

    /// Stamp `deleted_at`. Returns false if the row was absent or already deleted.
    pub fn soft_delete<E: Entity>(&self, id: u64) -> Result<bool, StorageError> {
        let Some(mut entity) = self.find_by_id::<E>(id)? else {
            return Ok(false);
        };
        let now = Utc::now();
        entity.record_mut().deleted_at = Some(now);
        entity.record_mut().updated_at = now;
        self.tree::<E>()?.insert(key(id), serde_json::to_vec(&entity)?)?;
        Ok(true)
    }

    // --- Users: unique email ---

    /// Create a user, failing with `Conflict` if the email is taken.
    pub fn create_user(&self, mut user: User) -> Result<User, StorageError> {
        user.email = normalize_email(&user.email);
        stamp_new(&mut user.record, self.next_id()?);
        let row = serde_json::to_vec(&user)?;
        let email = user.email.clone();

        (&self.users, &self.users_by_email)
            .transaction(|(users, by_email)| {
                if by_email.get(email.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(StorageError::Conflict(
                        "email already registered".to_string(),
                    )));
                }
                by_email.insert(email.as_bytes(), key(user.record.id).to_vec())?;
                users.insert(key(user.record.id).to_vec(), row.clone())?;
                Ok(())
            })
            .map_err(unwrap_tx_error)?;
        Ok(user)
    }

    /// Overwrite a live user, moving the email index entry if the email
    /// changed. Fails with `Conflict` if the new email is taken.
    pub fn update_user(&self, user: &mut User) -> Result<(), StorageError> {
        let id = user.record.id;
        user.email = normalize_email(&user.email);
        user.record.updated_at = Utc::now();
        let row = serde_json::to_vec(&*user)?;
        let email = user.email.clone();

        (&self.users, &self.users_by_email)
            .transaction(|(users, by_email)| {
                let current: User = match users.get(key(id))? {
                    Some(bytes) => serde_json::from_slice(&bytes).map_err(abort)?,
                    None => return Err(abort(StorageError::NotFound { entity: User::TREE, id })),
                };
                if current.is_deleted() {
                    return Err(abort(StorageError::NotFound { entity: User::TREE, id }));
                }
                if current.email != email {
                    if by_email.get(email.as_bytes())?.is_some() {
                        return Err(abort(StorageError::Conflict(
                            "email already registered".to_string(),
                        )));
                    }
                    by_email.remove(current.email.as_bytes())?;
                    by_email.insert(email.as_bytes(), key(id).to_vec())?;
                }
                users.insert(key(id).to_vec(), row.clone())?;
                Ok(())
            })
            .map_err(unwrap_tx_error)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StorageError> {
        match self.users_by_email.get(normalize_email(email).as_bytes())? {
            Some(id) => self.find_by_id::<User>(read_id(&id)),
            None => Ok(None),
        }
    }

    // --- Tickets and visits: one unit of work ---

    /// Run `f` inside one sled transaction over the ticket, visit and
    /// open-ticket trees. Either every write in `f` lands or none do.
    /// `f` may run more than once when sled retries a conflict.
    pub fn ticket_transaction<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: Fn(&TicketTx<'_>) -> TxResult<T>,
    {
        (&self.tickets, &self.visits, &self.open_tickets)
            .transaction(|(tickets, visits, open_tickets)| {
                f(&TicketTx {
                    tickets,
                    visits,
                    open_tickets,
                })
            })
            .map_err(unwrap_tx_error)
    }
}

/// Transactional view handed to [`Storage::ticket_transaction`] closures.
pub struct TicketTx<'a> {
    tickets: &'a TransactionalTree,
    visits: &'a TransactionalTree,
    open_tickets: &'a TransactionalTree,
}

impl TicketTx<'_> {
    /// The live, non-completed ticket for this pair, if any.
    pub fn open_ticket(&self, customer_id: u64, course_id: u64) -> TxResult<Option<Ticket>> {
        let Some(id) = self.open_tickets.get(pair_key(customer_id, course_id))? else {
            return Ok(None);
        };
        let Some(bytes) = self.tickets.get(id)? else {
            return Ok(None);
        };
        let ticket: Ticket = serde_json::from_slice(&bytes).map_err(abort)?;
        Ok((!ticket.is_deleted() && !ticket.is_completed).then_some(ticket))
    }

    /// Insert or update a ticket and keep the open-ticket index in step.
    pub fn save_ticket(&self, ticket: &mut Ticket) -> TxResult<()> {
        let now = Utc::now();
        if ticket.record.id == 0 {
            stamp_new(&mut ticket.record, self.tickets.generate_id()? + 1);
        } else {
            ticket.record.updated_at = now;
        }
        let id = key(ticket.record.id).to_vec();
        let pair = pair_key(ticket.customer_id, ticket.course_id).to_vec();

        self.tickets
            .insert(id.clone(), serde_json::to_vec(ticket).map_err(abort)?)?;
        if ticket.is_completed {
            self.open_tickets.remove(pair)?;
        } else {
            self.open_tickets.insert(pair, id)?;
        }
        Ok(())
    }

    pub fn insert_visit(&self, visit: &mut Visit) -> TxResult<()> {
        stamp_new(&mut visit.record, self.visits.generate_id()? + 1);
        self.visits.insert(
            key(visit.record.id).to_vec(),
            serde_json::to_vec(visit).map_err(abort)?,
        )?;
        Ok(())
    }
}

/// Abort the surrounding transaction with `err`.
pub fn abort<E: Into<StorageError>>(err: E) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err.into())
}

fn unwrap_tx_error(err: TransactionError<StorageError>) -> StorageError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StorageError::Sled(e),
    }
}

fn stamp_new(record: &mut Record, id: u64) {
    let now = Utc::now();
    record.id = id;
    record.created_at = now;
    record.updated_at = now;
    record.deleted_at = None;
}

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn read_id(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_be_bytes(buf)
}

fn pair_key(customer_id: u64, course_id: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&customer_id.to_be_bytes());
    out[8..].copy_from_slice(&course_id.to_be_bytes());
    out
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Course, Store};
    use crate::token::Role;

    fn course(total: u32) -> Course {
        Course {
            record: Record::default(),
            name: "Head spa x3".to_string(),
            price: 12000,
            total_count: total,
            store_id: 1,
        }
    }

    fn user(email: &str) -> User {
        User {
            record: Record::default(),
            name: "Aiko".to_string(),
            email: email.to_string(),
            password_hash: "$argon2id$stub".to_string(),
            role: Role::Staff,
            store_id: 1,
        }
    }

    #[test]
    fn create_find_update_soft_delete() {
        let storage = Storage::temporary().unwrap();
        let created = storage.create(course(3)).unwrap();
        assert!(created.id() > 0);

        let mut found = storage.find_by_id::<Course>(created.id()).unwrap().unwrap();
        assert_eq!(found.total_count, 3);

        found.price = 15000;
        storage.update(&mut found).unwrap();
        let reread = storage.find_by_id::<Course>(created.id()).unwrap().unwrap();
        assert_eq!(reread.price, 15000);

        assert!(storage.soft_delete::<Course>(created.id()).unwrap());
        assert!(storage.find_by_id::<Course>(created.id()).unwrap().is_none());
        assert!(storage.list::<Course>().unwrap().is_empty());
        assert!(!storage.soft_delete::<Course>(created.id()).unwrap());
    }

    #[test]
    fn update_of_missing_row_is_not_found() {
        let storage = Storage::temporary().unwrap();
        let mut ghost = course(1);
        ghost.record.id = 999;
        assert!(matches!(
            storage.update(&mut ghost),
            Err(StorageError::NotFound { entity: "courses", id: 999 })
        ));
    }

    #[test]
    fn find_one_and_list_where_filter_rows() {
        let storage = Storage::temporary().unwrap();
        for name in ["Ginza", "Shibuya", "Ueno"] {
            storage
                .create(Store {
                    record: Record::default(),
                    name: name.to_string(),
                })
                .unwrap();
        }
        let hit = storage.find_one(|s: &Store| s.name == "Shibuya").unwrap().unwrap();
        assert_eq!(hit.name, "Shibuya");
        let some = storage.list_where(|s: &Store| s.name.contains('n')).unwrap();
        assert_eq!(some.len(), 2);
    }

    #[test]
    fn duplicate_email_conflicts() {
        let storage = Storage::temporary().unwrap();
        let first = storage.create_user(user("Aiko@Example.com")).unwrap();
        assert_eq!(first.email, "aiko@example.com");

        let err = storage.create_user(user("aiko@example.com ")).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        let found = storage.find_user_by_email("AIKO@example.com").unwrap().unwrap();
        assert_eq!(found.record.id, first.record.id);
        assert!(storage.find_user_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn update_user_moves_email_index() {
        let storage = Storage::temporary().unwrap();
        let mut aiko = storage.create_user(user("aiko@example.com")).unwrap();
        storage.create_user(user("ren@example.com")).unwrap();

        aiko.email = "REN@example.com".to_string();
        let err = storage.update_user(&mut aiko).unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        aiko.email = "Aiko.New@example.com".to_string();
        aiko.name = "Aiko N".to_string();
        storage.update_user(&mut aiko).unwrap();
        assert!(storage.find_user_by_email("aiko@example.com").unwrap().is_none());
        let found = storage.find_user_by_email("aiko.new@example.com").unwrap().unwrap();
        assert_eq!(found.record.id, aiko.record.id);
        assert_eq!(found.name, "Aiko N");

        let mut ghost = user("ghost@example.com");
        ghost.record.id = 999;
        assert!(matches!(
            storage.update_user(&mut ghost),
            Err(StorageError::NotFound { id: 999, .. })
        ));
    }

    #[test]
    fn aborted_ticket_transaction_writes_nothing() {
        let storage = Storage::temporary().unwrap();
        let result: Result<(), StorageError> = storage.ticket_transaction(|tx| {
            let mut ticket = Ticket {
                record: Record::default(),
                customer_id: 1,
                course_id: 2,
                store_id: 1,
                total_count: 3,
                current_count: 1,
                is_completed: false,
            };
            tx.save_ticket(&mut ticket)?;
            Err(abort(StorageError::Conflict("boom".to_string())))
        });
        assert!(result.is_err());
        assert!(storage.list::<Ticket>().unwrap().is_empty());
        let open = storage
            .ticket_transaction(|tx| tx.open_ticket(1, 2))
            .unwrap();
        assert!(open.is_none());
    }

    #[test]
    fn completed_ticket_leaves_open_index() {
        let storage = Storage::temporary().unwrap();
        let mut ticket = Ticket {
            record: Record::default(),
            customer_id: 4,
            course_id: 5,
            store_id: 1,
            total_count: 1,
            current_count: 0,
            is_completed: false,
        };
        let saved = storage
            .ticket_transaction(|tx| {
                let mut t = ticket.clone();
                tx.save_ticket(&mut t)?;
                Ok(t)
            })
            .unwrap();
        let open = storage.ticket_transaction(|tx| tx.open_ticket(4, 5)).unwrap();
        assert_eq!(open.map(|t| t.record.id), Some(saved.record.id));

        ticket = saved;
        ticket.current_count = 1;
        ticket.is_completed = true;
        storage
            .ticket_transaction(|tx| tx.save_ticket(&mut ticket.clone()))
            .unwrap();
        assert!(storage.ticket_transaction(|tx| tx.open_ticket(4, 5)).unwrap().is_none());
    }
}
