//! End-to-end encrypted sessions between a user and an admin.
//!
//! Keys live only in memory. The durable store holds the public handshake
//! (`SessionOffer`) so either party can recover the key from its own
//! communication secret; after a restart every session is logically new.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use w3b2_shared::crypto::{self, SymmetricKey};
use w3b2_shared::error::CryptoError;
use w3b2_shared::protocol::SessionOffer;
use w3b2_shared::types::{Pubkey, SessionId, SessionStatus};
use w3b2_store::SessionRecord;

use crate::error::{BridgeError, Result};
use crate::fanout::{Notice, NotificationHub};
use crate::mirror::MirrorStore;

struct LiveSession {
    offer: SessionOffer,
    key: SymmetricKey,
    last_used: DateTime<Utc>,
}

/// Public view of an active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub offer: SessionOffer,
    pub status: SessionStatus,
    pub last_used: DateTime<Utc>,
}

pub struct SessionManager {
    mirror: Arc<MirrorStore>,
    hub: Arc<NotificationHub>,
    idle: chrono::Duration,
    sessions: RwLock<HashMap<SessionId, LiveSession>>,
}

impl SessionManager {
    pub fn new(mirror: Arc<MirrorStore>, hub: Arc<NotificationHub>, idle: Duration) -> Self {
        Self {
            mirror,
            hub,
            idle: chrono::Duration::from_std(idle)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session for a mirrored (user, admin) pair.
    pub async fn open(&self, user: &Pubkey, admin: &Pubkey) -> Result<SessionOffer> {
        let admin_profile = self.mirror.get_admin(admin)?;
        let user_profile = self.mirror.get_user(user, admin)?;

        let exchange = crypto::establish_session_key(
            user,
            admin,
            &user_profile.communication_pubkey,
            &admin_profile.communication_pubkey,
        )?;

        let now = Utc::now();
        let offer = SessionOffer {
            session_id: SessionId::new(),
            user: *user,
            admin: *admin,
            ephemeral_pubkey: exchange.ephemeral_pubkey,
            user_envelope: exchange.user_envelope,
            created_at: now,
            expires_at: now + self.idle,
        };

        self.mirror.store().read(|db| {
            db.insert_session(&SessionRecord {
                session_id: offer.session_id,
                user: offer.user,
                admin: offer.admin,
                ephemeral_pubkey: offer.ephemeral_pubkey,
                user_envelope: offer.user_envelope.clone(),
                status: SessionStatus::Active,
                created_at: offer.created_at,
                expires_at: offer.expires_at,
            })
        })?;

        self.sessions.write().await.insert(
            offer.session_id,
            LiveSession {
                offer: offer.clone(),
                key: exchange.session_key,
                last_used: now,
            },
        );

        info!(
            session = %offer.session_id,
            user = %user.short(),
            admin = %admin.short(),
            "session opened"
        );
        self.hub.publish_notice(Notice::SessionOpened {
            session_id: offer.session_id,
            user: *user,
            admin: *admin,
            expires_at: offer.expires_at,
        });
        Ok(offer)
    }

    /// Most recently used live session for the pair, if any.
    pub async fn active_for(&self, user: &Pubkey, admin: &Pubkey) -> Option<SessionId> {
        let now = Utc::now();
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.offer.user == *user && s.offer.admin == *admin)
            .filter(|s| now - s.last_used <= self.idle)
            .max_by_key(|s| s.last_used)
            .map(|s| s.offer.session_id)
    }

    pub async fn get(&self, id: &SessionId) -> Result<SessionInfo> {
        if let Some(live) = self.sessions.read().await.get(id) {
            return Ok(SessionInfo {
                offer: live.offer.clone(),
                status: SessionStatus::Active,
                last_used: live.last_used,
            });
        }
        Err(self.missing(id)?)
    }

    pub async fn encrypt(&self, id: &SessionId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.touch(id).await?;
        Ok(crypto::encrypt(&key, plaintext)?)
    }

    /// Fails closed: any authentication failure is `AuthenticationFailed`.
    pub async fn decrypt(&self, id: &SessionId, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self.touch(id).await?;
        crypto::decrypt(&key, ciphertext).map_err(|e| match e {
            CryptoError::DecryptionFailed => BridgeError::AuthenticationFailed,
            other => BridgeError::Crypto(other),
        })
    }

    /// Close a session. Closing an already ended session is a no-op.
    pub async fn close(&self, id: &SessionId) -> Result<()> {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(live) => self.end(&live.offer, SessionStatus::Closed),
            None => match self.mirror.store().read(|db| db.find_session(id))? {
                Some(_) => Ok(()),
                None => Err(BridgeError::NoSuchSession(*id)),
            },
        }
    }

    /// Expire every session idle since before `now - idle`.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<LiveSession> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| now - s.last_used > self.idle)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for live in &expired {
            self.end(&live.offer, SessionStatus::Expired)?;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "idle sessions expired");
        }
        Ok(expired.len())
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Renew a live session and hand out its key.
    async fn touch(&self, id: &SessionId) -> Result<SymmetricKey> {
        let now = Utc::now();
        let stale = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(id) {
                Some(live) if now - live.last_used <= self.idle => {
                    live.last_used = now;
                    return Ok(live.key);
                }
                Some(_) => sessions.remove(id),
                None => None,
            }
        };

        match stale {
            Some(live) => {
                self.end(&live.offer, SessionStatus::Expired)?;
                Err(BridgeError::SessionExpired(*id))
            }
            None => Err(self.missing(id)?),
        }
    }

    /// Error for a session that is not live, based on its durable record.
    fn missing(&self, id: &SessionId) -> Result<BridgeError> {
        let record = self.mirror.store().read(|db| db.find_session(id))?;
        Ok(match record {
            Some(record) if record.status == SessionStatus::Expired => {
                BridgeError::SessionExpired(*id)
            }
            // Active on disk but not in memory: left over from a previous run.
            Some(record) if record.status == SessionStatus::Active => {
                BridgeError::SessionExpired(*id)
            }
            _ => BridgeError::NoSuchSession(*id),
        })
    }

    fn end(&self, offer: &SessionOffer, status: SessionStatus) -> Result<()> {
        self.mirror
            .store()
            .read(|db| db.set_session_status(&offer.session_id, status))?;
        info!(session = %offer.session_id, %status, "session ended");
        self.hub.publish_notice(Notice::SessionEnded {
            session_id: offer.session_id,
            user: offer.user,
            admin: offer.admin,
            status,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use w3b2_shared::crypto::{comm_public_key, generate_comm_secret, recover_session_key_as_admin};
    use w3b2_shared::events::*;
    use w3b2_shared::types::EventPosition;
    use w3b2_store::Database;

    use super::*;
    use crate::store::Store;

    const ADMIN: Pubkey = Pubkey([2; 32]);
    const USER: Pubkey = Pubkey([1; 32]);

    struct Fixture {
        sessions: SessionManager,
        admin_secret: [u8; 32],
    }

    fn envelope(seq: u64, event: BridgeEvent) -> EventEnvelope {
        EventEnvelope {
            position: EventPosition {
                slot: seq,
                seq,
                signature: String::new(),
            },
            event,
        }
    }

    fn fixture(idle: Duration) -> Fixture {
        let mirror = Arc::new(MirrorStore::new(Store::new(
            Database::open_in_memory().unwrap(),
        )));
        let admin_secret = generate_comm_secret();
        mirror
            .apply(&envelope(
                1,
                BridgeEvent::AdminProfileRegistered(AdminProfileRegistered {
                    authority: ADMIN,
                    communication_pubkey: comm_public_key(&admin_secret),
                    ts: 0,
                }),
            ))
            .unwrap();
        mirror
            .apply(&envelope(
                2,
                BridgeEvent::UserProfileCreated(UserProfileCreated {
                    authority: USER,
                    target_admin: ADMIN,
                    communication_pubkey: comm_public_key(&generate_comm_secret()),
                    ts: 0,
                }),
            ))
            .unwrap();

        Fixture {
            sessions: SessionManager::new(mirror, Arc::new(NotificationHub::new(8)), idle),
            admin_secret,
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_admin_recovers_key() {
        let f = fixture(Duration::from_secs(60));
        let offer = f.sessions.open(&USER, &ADMIN).await.unwrap();

        let ciphertext = f.sessions.encrypt(&offer.session_id, b"hello").await.unwrap();
        assert_eq!(
            f.sessions.decrypt(&offer.session_id, &ciphertext).await.unwrap(),
            b"hello"
        );

        let admin_key =
            recover_session_key_as_admin(&f.admin_secret, &offer.ephemeral_pubkey, &USER, &ADMIN)
                .unwrap();
        assert_eq!(crypto::decrypt(&admin_key, &ciphertext).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_other_session_fails_authentication() {
        let f = fixture(Duration::from_secs(60));
        let a = f.sessions.open(&USER, &ADMIN).await.unwrap();
        let b = f.sessions.open(&USER, &ADMIN).await.unwrap();

        let ciphertext = f.sessions.encrypt(&a.session_id, b"secret").await.unwrap();
        assert!(matches!(
            f.sessions.decrypt(&b.session_id, &ciphertext).await,
            Err(BridgeError::AuthenticationFailed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_pair_is_no_such_profile() {
        let f = fixture(Duration::from_secs(60));
        assert!(matches!(
            f.sessions.open(&Pubkey([9; 32]), &ADMIN).await,
            Err(BridgeError::NoSuchProfile(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture(Duration::from_secs(60));
        let offer = f.sessions.open(&USER, &ADMIN).await.unwrap();

        f.sessions.close(&offer.session_id).await.unwrap();
        f.sessions.close(&offer.session_id).await.unwrap();
        assert!(matches!(
            f.sessions.encrypt(&offer.session_id, b"x").await,
            Err(BridgeError::NoSuchSession(_))
        ));
        assert!(matches!(
            f.sessions.close(&SessionId::new()).await,
            Err(BridgeError::NoSuchSession(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let f = fixture(Duration::from_secs(60));
        let offer = f.sessions.open(&USER, &ADMIN).await.unwrap();
        assert_eq!(f.sessions.active_for(&USER, &ADMIN).await, Some(offer.session_id));

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(f.sessions.expire_idle(later).await.unwrap(), 1);
        assert_eq!(f.sessions.active_count().await, 0);
        assert!(matches!(
            f.sessions.encrypt(&offer.session_id, b"x").await,
            Err(BridgeError::SessionExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_lazy_expiry_on_use() {
        let f = fixture(Duration::ZERO);
        let offer = f.sessions.open(&USER, &ADMIN).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(matches!(
            f.sessions.encrypt(&offer.session_id, b"x").await,
            Err(BridgeError::SessionExpired(_))
        ));
    }
}
