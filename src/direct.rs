//! Encrypted direct messages addressed by recipient key over the core relays.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    crypto::{DirectCipher, KeyError, Signer, UnsignedEvent},
    event::{now_secs, Event, Tag, DIRECT_KIND, RECIPIENT_TAG},
    lock,
    relay_set::RelaySet,
    subscription::{Filter, Handler, SeenIds, SharedSeen, Subscription},
    transport::RelayTransport,
};

/// A decrypted direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectMessage {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct DirectSettings {
    pub lookback_secs: u64,
    pub limit: usize,
    pub verify_sig: bool,
}

pub struct DirectMessageChannel {
    signer: Arc<dyn Signer>,
    cipher: Arc<dyn DirectCipher>,
    transport: Arc<dyn RelayTransport>,
    core: RelaySet,
    settings: DirectSettings,
    active: Mutex<Option<Subscription>>,
    /// Dedup set of the key currently listened for.
    seen: Mutex<Option<(String, SharedSeen)>>,
}

impl DirectMessageChannel {
    pub fn new(
        signer: Arc<dyn Signer>,
        cipher: Arc<dyn DirectCipher>,
        transport: Arc<dyn RelayTransport>,
        core: RelaySet,
        settings: DirectSettings,
    ) -> Self {
        Self {
            signer,
            cipher,
            transport,
            core,
            settings,
            active: Mutex::new(None),
            seen: Mutex::new(None),
        }
    }

    /// Listen for messages addressed to `my_key`, replacing any previous
    /// subscription. The old subscription is closed before the new one opens,
    /// and messages already delivered for the same key are not delivered
    /// again. Messages that fail to decrypt are dropped and their id
    /// forgotten, so a later copy is still accepted.
    pub fn subscribe(&self, my_key: &str, handler: Handler<DirectMessage>) {
        let mut active = lock(&self.active);
        if let Some(mut old) = active.take() {
            old.close();
        }
        let seen = {
            let mut current = lock(&self.seen);
            match current.as_ref() {
                Some((key, seen)) if key == my_key => seen.clone(),
                _ => {
                    let seen: SharedSeen = Arc::new(Mutex::new(SeenIds::default()));
                    *current = Some((my_key.to_string(), seen.clone()));
                    seen
                }
            }
        };
        let cipher = self.cipher.clone();
        let me = my_key.to_string();
        let forget = seen.clone();
        let deliver: Handler<Event> = Arc::new(move |ev: Event| {
            match cipher.decrypt(&ev.pubkey, &ev.content) {
                Ok(content) => handler(DirectMessage {
                    recipient: ev.first_tag(RECIPIENT_TAG).unwrap_or(&me).to_string(),
                    id: ev.id,
                    sender: ev.pubkey,
                    content,
                    created_at: ev.created_at,
                }),
                Err(e) => {
                    warn!(id = %ev.id, sender = %ev.pubkey, error = %e, "dropping undecryptable direct message");
                    lock(&forget).forget(&ev.id);
                }
            }
        });
        let filter = Filter::Indexed {
            kinds: vec![DIRECT_KIND],
            tags: BTreeMap::from([(RECIPIENT_TAG.to_string(), vec![my_key.to_string()])]),
            since: Some(now_secs().saturating_sub(self.settings.lookback_secs)),
            limit: self.settings.limit,
            scope: None,
        };
        let sub = Subscription::open(
            self.transport.as_ref(),
            self.core.clone(),
            vec![filter],
            seen,
            self.settings.verify_sig,
            deliver,
        );
        *active = Some(sub);
        debug!(relays = self.core.len(), "direct messages subscribed");
    }

    /// Encrypt, sign and fire a message to `recipient` on the core relays.
    ///
    /// Keys of the wrong length are rejected here; anything else is left for
    /// the cipher to judge.
    pub fn send(&self, recipient: &str, content: &str) -> Result<DirectMessage> {
        let recipient = recipient.trim();
        if recipient.len() != 64 {
            return Err(KeyError::InvalidLength(recipient.len()).into());
        }
        let ciphertext = self.cipher.encrypt(recipient, content)?;
        let event = self.signer.sign(UnsignedEvent {
            pubkey: self.signer.public_key(),
            created_at: now_secs(),
            kind: DIRECT_KIND,
            tags: vec![Tag::new(RECIPIENT_TAG, recipient)],
            content: ciphertext,
        })?;
        let message = DirectMessage {
            id: event.id.clone(),
            sender: event.pubkey.clone(),
            recipient: recipient.to_string(),
            content: content.to_string(),
            created_at: event.created_at,
        };

        let transport = self.transport.clone();
        let core = self.core.clone();
        tokio::spawn(async move {
            match transport.publish(&core, &event).await {
                Ok(n) => debug!(id = %event.id, relays = n, "direct message published"),
                Err(e) => warn!(id = %event.id, error = %e, "direct message publish failed"),
            }
        });
        Ok(message)
    }

    pub fn close(&self) {
        if let Some(mut sub) = lock(&self.active).take() {
            sub.close();
        }
    }
}
