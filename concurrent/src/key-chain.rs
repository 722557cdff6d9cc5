// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # key chains
//!
//! Every mutation the node accepts is a signed document. The signer is an account ID (a CCID);
//! the signature may have been produced by the account's master key or by a *subkey* (a CKID)
//! the account enacted earlier, possibly by way of other subkeys. This module maintains those keys
//! & verifies signatures against them.
//!
//! A chain of keys, read from a subkey upward, is acceptable at time T when:
//!
//! - each key's parent is the next key in the chain, the last one's parent being the root account;
//! - each key's enact document was signed by its parent & names the key, its parent & its root;
//! - every key shares the same root;
//! - no key has been revoked, and every key was enacted no later than T.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use http::StatusCode;
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use tracing::{debug, instrument, warn};

use concurrent_shared::{
    crypto,
    documents::{self, Body, Document},
    entities::{is_ccid, is_ckid, Key},
};

use crate::{
    cache::Cache,
    peer::{self, Peers},
    storage::{self, Backend as StorageBackend},
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module Error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Key {id} has already been enacted"))]
    AlreadyEnacted { id: String, backtrace: Backtrace },
    #[snafu(display("Key {id} is not a child of {expected}"))]
    BrokenChain {
        id: String,
        expected: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The key chain for {id} is deeper than {MAX_DEPTH}"))]
    ChainTooDeep { id: String, backtrace: Backtrace },
    #[snafu(display("Failed to parse the document: {source}"))]
    Document {
        source: documents::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The enact or revoke document for {id} disagrees with the key on its {field}"))]
    EnactMismatch {
        id: String,
        field: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Key {id} was not in effect at {at}"))]
    NotEffective {
        id: String,
        at: DateTime<Utc>,
        backtrace: Backtrace,
    },
    #[snafu(display("{id} is not a subkey ID"))]
    NotSubkey { id: String, backtrace: Backtrace },
    #[snafu(display("The parent {parent} is not the performing key {performer}"))]
    ParentMismatch {
        parent: String,
        performer: String,
        backtrace: Backtrace,
    },
    #[snafu(display("While resolving {id} remotely, {source}"))]
    Peer {
        id: String,
        source: peer::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Key {id} has been revoked"))]
    Revoked { id: String, backtrace: Backtrace },
    #[snafu(display("The key chain leads to {found}, not {expected}"))]
    RootMismatch {
        expected: String,
        found: String,
        backtrace: Backtrace,
    },
    #[snafu(display("The performer's key chain ({performer}) is deeper than the target's ({target})"))]
    ShallowTarget {
        target: usize,
        performer: usize,
        backtrace: Backtrace,
    },
    #[snafu(display("Bad signature: {source}"))]
    Signature {
        source: crypto::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Storage error: {source}"))]
    Storage {
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown key {id}"))]
    UnknownKey { id: String, backtrace: Backtrace },
    #[snafu(display("Expected a {expected} document, got {typ}"))]
    WrongType {
        expected: &'static str,
        typ: String,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Everything short of a storage failure or a duplicate key is an authentication failure
    pub fn status(&self) -> StatusCode {
        match self {
            Error::AlreadyEnacted { .. } => StatusCode::CONFLICT,
            Error::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Key chains are never followed further than this
pub const MAX_DEPTH: usize = 8;

/// Remote key resolutions are cached this long
const REMOTE_CHAIN_TTL: Duration = Duration::from_secs(600);

fn cache_key(id: &str) -> String {
    format!("keychain:{id}")
}

/// Check a key chain, read upward from a subkey, for acceptability at `at`; return its root
pub fn validate_key_resolution(keys: &[Key], at: &DateTime<Utc>) -> Result<String> {
    let mut root: Option<&str> = None;
    let mut next: Option<&str> = None;
    for key in keys {
        if let Some(expected) = next {
            ensure!(
                expected == key.id,
                BrokenChainSnafu {
                    id: &key.id,
                    expected
                }
            );
        }
        crypto::verify_signature(
            key.enact_document.as_bytes(),
            &key.enact_signature,
            &key.parent,
        )
        .context(SignatureSnafu)?;
        let enact = Document::parse(&key.enact_document).context(DocumentSnafu)?;
        let Body::Enact(body) = &enact.body else {
            return WrongTypeSnafu {
                expected: "enact",
                typ: enact.header.typ,
            }
            .fail();
        };
        ensure!(
            enact.header.signer == key.root,
            EnactMismatchSnafu {
                id: &key.id,
                field: "signer"
            }
        );
        ensure!(
            body.target == key.id,
            EnactMismatchSnafu {
                id: &key.id,
                field: "target"
            }
        );
        ensure!(
            body.parent == key.parent,
            EnactMismatchSnafu {
                id: &key.id,
                field: "parent"
            }
        );
        ensure!(
            body.root == key.root,
            EnactMismatchSnafu {
                id: &key.id,
                field: "root"
            }
        );
        ensure!(
            enact.header.signed_at == key.valid_since,
            EnactMismatchSnafu {
                id: &key.id,
                field: "validSince"
            }
        );
        if let Some(revoke_document) = &key.revoke_document {
            let revoke = Document::parse(revoke_document).context(DocumentSnafu)?;
            let Body::Revoke(body) = &revoke.body else {
                return WrongTypeSnafu {
                    expected: "revoke",
                    typ: revoke.header.typ,
                }
                .fail();
            };
            ensure!(
                body.target == key.id && key.valid_until == Some(revoke.header.signed_at),
                EnactMismatchSnafu {
                    id: &key.id,
                    field: "validUntil"
                }
            );
        }
        match root {
            Some(root) => ensure!(
                root == key.root,
                RootMismatchSnafu {
                    expected: root,
                    found: &key.root
                }
            ),
            None => root = Some(&key.root),
        }
        ensure!(!key.is_revoked(), RevokedSnafu { id: &key.id });
        ensure!(
            key.is_effective_at(at),
            NotEffectiveSnafu {
                id: &key.id,
                at: *at
            }
        );
        next = Some(&key.parent);
    }
    // The chain must terminate at the root account itself
    if let (Some(root), Some(last)) = (root, next) {
        ensure!(
            root == last,
            BrokenChainSnafu {
                id: last,
                expected: root
            }
        );
    }
    Ok(root.unwrap_or_default().to_owned())
}

/// The node's key-chain resolver
pub struct KeyChain {
    storage: Arc<dyn StorageBackend + Send + Sync>,
    cache: Arc<dyn Cache + Send + Sync>,
    peers: Arc<Peers>,
    fqdn: String,
}

impl KeyChain {
    pub fn new(
        storage: Arc<dyn StorageBackend + Send + Sync>,
        cache: Arc<dyn Cache + Send + Sync>,
        peers: Arc<Peers>,
        fqdn: &str,
    ) -> KeyChain {
        KeyChain {
            storage,
            cache,
            peers,
            fqdn: fqdn.to_owned(),
        }
    }

    /// The chain of keys from `id` up to (but not including) the root account
    pub async fn get_key_resolution(&self, id: &str) -> Result<Vec<Key>> {
        let mut keys = Vec::new();
        let mut id = id.to_owned();
        while !is_ccid(&id) {
            ensure!(keys.len() < MAX_DEPTH, ChainTooDeepSnafu { id });
            let key = self
                .storage
                .get_key(&id)
                .await
                .context(StorageSnafu)?
                .context(UnknownKeySnafu { id: &id })?;
            id = key.parent.clone();
            keys.push(key);
        }
        Ok(keys)
    }

    /// Resolve a locally-held subkey to its root account, checking the chain at `at`
    pub async fn resolve_subkey(&self, id: &str, at: &DateTime<Utc>) -> Result<String> {
        let keys = self.get_key_resolution(id).await?;
        if keys.is_empty() {
            return Ok(id.to_owned());
        }
        validate_key_resolution(&keys, at)
    }

    /// Resolve a subkey held by `domain` to its root account, checking the chain at `at`
    ///
    /// The peer's answer is cached; either way, the chain is validated here in full.
    pub async fn resolve_remote_subkey(
        &self,
        id: &str,
        domain: &str,
        at: &DateTime<Utc>,
    ) -> Result<String> {
        let cached: Option<Vec<Key>> = match self.cache.get(&cache_key(id)).await {
            Ok(text) => text.and_then(|text| serde_json::from_str(&text).ok()),
            Err(err) => {
                warn!("Failed to consult the cache for {id}: {err}");
                None
            }
        };
        let keys = match cached {
            Some(keys) => keys,
            None => {
                self.peers
                    .ensure_same_dimension(domain)
                    .await
                    .context(PeerSnafu { id })?;
                let keys = self
                    .peers
                    .get_key_resolution(domain, id)
                    .await
                    .context(PeerSnafu { id })?;
                ensure!(keys.len() <= MAX_DEPTH, ChainTooDeepSnafu { id });
                ensure!(
                    keys.first().is_some_and(|key| key.id == id),
                    BrokenChainSnafu {
                        id: keys.first().map(|k| k.id.clone()).unwrap_or_default(),
                        expected: id
                    }
                );
                self.cache_chain(id, &keys).await;
                keys
            }
        };
        validate_key_resolution(&keys, at)
    }

    async fn cache_chain(&self, id: &str, keys: &[Key]) {
        let text = match serde_json::to_string(keys) {
            Ok(text) => text,
            Err(err) => {
                warn!("Failed to serialize the key chain for {id}: {err}");
                return;
            }
        };
        if let Err(err) = self
            .cache
            .set(&cache_key(id), &text, Some(REMOTE_CHAIN_TTL))
            .await
        {
            warn!("Failed to cache the key chain for {id}: {err}");
        }
    }

    /// The domain on which `ccid` is homed; accounts we've never heard of are taken to be ours
    async fn home_of(&self, ccid: &str) -> Result<String> {
        Ok(self
            .storage
            .get_entity(ccid)
            .await
            .context(StorageSnafu)?
            .map(|entity| entity.domain)
            .unwrap_or_else(|| self.fqdn.clone()))
    }

    /// Verify `signature` over `document`, following the signer's key chain if a subkey signed it
    #[instrument(skip_all)]
    pub async fn validate_signed_object(&self, document: &str, signature: &str) -> Result<Document> {
        let doc = Document::parse(document).context(DocumentSnafu)?;
        let header = &doc.header;
        if let Some(key_id) = &header.key_id {
            let home = self.home_of(&header.signer).await?;
            let root = if home == self.fqdn {
                self.resolve_subkey(key_id, &header.signed_at).await?
            } else {
                self.resolve_remote_subkey(key_id, &home, &header.signed_at)
                    .await?
            };
            ensure!(
                root == header.signer,
                RootMismatchSnafu {
                    expected: &header.signer,
                    found: root
                }
            );
        }
        crypto::verify_signature(document.as_bytes(), signature, header.performer())
            .context(SignatureSnafu)?;
        debug!("Verified a {} document from {}", header.typ, header.signer);
        Ok(doc)
    }

    /// Bring a new subkey into effect
    #[instrument(skip_all)]
    pub async fn enact(&self, document: &str, signature: &str) -> Result<Key> {
        let doc = Document::parse(document).context(DocumentSnafu)?;
        let Body::Enact(body) = &doc.body else {
            return WrongTypeSnafu {
                expected: "enact",
                typ: doc.header.typ,
            }
            .fail();
        };
        let header = &doc.header;
        ensure!(
            header.signer == body.root,
            RootMismatchSnafu {
                expected: &body.root,
                found: &header.signer
            }
        );
        ensure!(
            header.performer() == body.parent,
            ParentMismatchSnafu {
                parent: &body.parent,
                performer: header.performer()
            }
        );
        if !is_ccid(&body.parent) {
            let root = self.resolve_subkey(&body.parent, &header.signed_at).await?;
            ensure!(
                root == body.root,
                RootMismatchSnafu {
                    expected: &body.root,
                    found: root
                }
            );
        }
        ensure!(is_ckid(&body.target), NotSubkeySnafu { id: &body.target });
        let key = Key {
            id: body.target.clone(),
            root: body.root.clone(),
            parent: body.parent.clone(),
            enact_document: document.to_owned(),
            enact_signature: signature.to_owned(),
            revoke_document: None,
            revoke_signature: None,
            valid_since: header.signed_at,
            valid_until: None,
        };
        ensure!(
            self.storage.enact_key(&key).await.context(StorageSnafu)?,
            AlreadyEnactedSnafu { id: &key.id }
        );
        Ok(key)
    }

    /// Withdraw a subkey; revoking a key that's already been revoked changes nothing
    #[instrument(skip_all)]
    pub async fn revoke(&self, document: &str, signature: &str) -> Result<Key> {
        let doc = Document::parse(document).context(DocumentSnafu)?;
        let Body::Revoke(body) = &doc.body else {
            return WrongTypeSnafu {
                expected: "revoke",
                typ: doc.header.typ,
            }
            .fail();
        };
        let header = &doc.header;
        let target = self.get_key_resolution(&body.target).await?;
        let performer = self.get_key_resolution(header.performer()).await?;
        ensure!(
            target.len() >= performer.len(),
            ShallowTargetSnafu {
                target: target.len(),
                performer: performer.len()
            }
        );
        let target_root = target
            .first()
            .map(|key| key.root.as_str())
            .context(NotSubkeySnafu { id: &body.target })?;
        ensure!(
            target_root == header.signer,
            RootMismatchSnafu {
                expected: &header.signer,
                found: target_root
            }
        );
        let key = self
            .storage
            .revoke_key(&body.target, document, signature, &header.signed_at)
            .await
            .context(StorageSnafu)?
            .context(UnknownKeySnafu { id: &body.target })?;
        if let Err(err) = self.cache.delete(&cache_key(&key.id)).await {
            warn!("Failed to evict {} from the cache: {}", key.id, err);
        }
        Ok(key)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::collections::HashMap;

    use chrono::TimeZone;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use concurrent_shared::{
        crypto::{derive_address, sign, Scheme},
        entities::Entity,
    };

    use crate::{
        cache::MemoryCache, client::make_client, memory::MemoryBackend, metrics::Instruments,
    };

    const ALICE: &str = "4646464646464646464646464646464646464646464646464646464646464646";
    const K1: &str = "0101010101010101010101010101010101010101010101010101010101010101";
    const K2: &str = "0202020202020202020202020202020202020202020202020202020202020202";

    fn ccid(private_key: &str) -> String {
        derive_address(private_key, Scheme::Bech32("con")).unwrap()
    }

    fn ckid(private_key: &str) -> String {
        derive_address(private_key, Scheme::Bech32("cck")).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// Sign `doc` with `private_key`, whose address is `address`
    fn signed(doc: serde_json::Value, private_key: &str, address: &str) -> (String, String) {
        let text = doc.to_string();
        let sig = sign(
            private_key,
            text.as_bytes(),
            Scheme::of(address).unwrap(),
        )
        .unwrap();
        (text, sig)
    }

    fn enact_doc(
        performer_key: &str,
        performer: &str,
        target: &str,
        parent: &str,
        secs: i64,
    ) -> (String, String) {
        let alice = ccid(ALICE);
        let mut doc = json!({
            "signer": alice,
            "type": "enact",
            "target": target,
            "root": alice,
            "parent": parent,
            "signedAt": at(secs),
        });
        if performer != alice {
            doc["keyID"] = json!(performer);
        }
        signed(doc, performer_key, performer)
    }

    async fn fixture(origins: HashMap<String, url::Url>) -> (KeyChain, Arc<MemoryBackend>) {
        let storage = Arc::new(MemoryBackend::new());
        let client = make_client(
            "concurrent unit tests",
            Arc::new(Instruments::new("concurrent-test")),
        )
        .unwrap();
        let peers = Arc::new(Peers::new(client, storage.clone(), "cc-test", origins));
        (
            KeyChain::new(
                storage.clone(),
                Arc::new(MemoryCache::new()),
                peers,
                "ours.example",
            ),
            storage,
        )
    }

    #[tokio::test]
    async fn master_key_signatures() {
        let (chain, _) = fixture(HashMap::new()).await;
        let alice = ccid(ALICE);
        let (doc, sig) = signed(
            json!({"signer": alice, "type": "message", "timelines": [], "signedAt": at(1000)}),
            ALICE,
            &alice,
        );
        chain.validate_signed_object(&doc, &sig).await.unwrap();
        let tampered = doc.replace("1970", "1971");
        assert!(matches!(
            chain.validate_signed_object(&tampered, &sig).await,
            Err(Error::Signature { .. })
        ));
    }

    #[tokio::test]
    async fn subkeys_enact_and_revoke() {
        let (chain, _) = fixture(HashMap::new()).await;
        let alice = ccid(ALICE);
        let k1 = ckid(K1);
        let k2 = ckid(K2);

        let (doc, sig) = enact_doc(ALICE, &alice, &k1, &alice, 1000);
        chain.validate_signed_object(&doc, &sig).await.unwrap();
        let key = chain.enact(&doc, &sig).await.unwrap();
        assert_eq!(key.valid_since, at(1000));
        assert!(matches!(
            chain.enact(&doc, &sig).await,
            Err(Error::AlreadyEnacted { .. })
        ));

        // K1 enacts K2
        let (doc, sig) = enact_doc(K1, &k1, &k2, &k1, 1100);
        chain.validate_signed_object(&doc, &sig).await.unwrap();
        chain.enact(&doc, &sig).await.unwrap();
        assert_eq!(chain.get_key_resolution(&k2).await.unwrap().len(), 2);
        assert_eq!(chain.resolve_subkey(&k2, &at(1200)).await.unwrap(), alice);
        // ...but not before K2 existed
        assert!(matches!(
            chain.resolve_subkey(&k2, &at(1050)).await,
            Err(Error::NotEffective { .. })
        ));

        // a message signed by K2
        let (msg, msg_sig) = signed(
            json!({"signer": alice, "keyID": k2, "type": "message", "signedAt": at(1200)}),
            K2,
            &k2,
        );
        chain.validate_signed_object(&msg, &msg_sig).await.unwrap();

        // K2 may not revoke its parent
        let (rev, rev_sig) = signed(
            json!({"signer": alice, "keyID": k2, "type": "revoke", "target": k1,
                   "signedAt": at(1300)}),
            K2,
            &k2,
        );
        assert!(matches!(
            chain.revoke(&rev, &rev_sig).await,
            Err(Error::ShallowTarget { .. })
        ));

        // Alice revokes K1, which takes K2 down with it
        let (rev, rev_sig) = signed(
            json!({"signer": alice, "type": "revoke", "target": k1, "signedAt": at(1300)}),
            ALICE,
            &alice,
        );
        let revoked = chain.revoke(&rev, &rev_sig).await.unwrap();
        assert_eq!(revoked.valid_until, Some(at(1300)));
        let again = chain.revoke(&rev, &rev_sig).await.unwrap();
        assert_eq!(again, revoked);
        assert!(matches!(
            chain.validate_signed_object(&msg, &msg_sig).await,
            Err(Error::Revoked { .. })
        ));
    }

    #[tokio::test]
    async fn enact_preconditions() {
        let (chain, _) = fixture(HashMap::new()).await;
        let alice = ccid(ALICE);
        let k1 = ckid(K1);
        // parent isn't the performer
        let (doc, sig) = enact_doc(ALICE, &alice, &k1, &ckid(K2), 1000);
        assert!(matches!(
            chain.enact(&doc, &sig).await,
            Err(Error::ParentMismatch { .. })
        ));
        // target isn't a subkey id
        let (doc, sig) = enact_doc(ALICE, &alice, &ccid(K2), &alice, 1000);
        assert!(matches!(
            chain.enact(&doc, &sig).await,
            Err(Error::NotSubkey { .. })
        ));
    }

    #[tokio::test]
    async fn remote_chains() {
        let server = MockServer::start().await;
        let alice = ccid(ALICE);
        let k1 = ckid(K1);
        let (enact, enact_sig) = enact_doc(ALICE, &alice, &k1, &alice, 1000);
        Mock::given(method("GET"))
            .and(path("/api/v1/domain"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": {"fqdn": "peer.example", "ccid": "con1peer", "dimension": "cc-test"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/v1/key/{k1}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "ok",
                "content": [{
                    "id": k1, "root": alice, "parent": alice,
                    "enactDocument": enact, "enactSignature": enact_sig,
                    "validSince": at(1000),
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (chain, storage) = fixture(HashMap::from([(
            "peer.example".to_owned(),
            url::Url::parse(&server.uri()).unwrap(),
        )]))
        .await;
        storage
            .upsert_entity(&Entity {
                ccid: alice.clone(),
                domain: "peer.example".to_owned(),
                tag: String::new(),
                alias: None,
                cdate: at(0),
            })
            .await
            .unwrap();

        let (msg, msg_sig) = signed(
            json!({"signer": alice, "keyID": k1, "type": "message", "signedAt": at(1200)}),
            K1,
            &k1,
        );
        chain.validate_signed_object(&msg, &msg_sig).await.unwrap();
        // the second time around, the chain comes from the cache
        chain.validate_signed_object(&msg, &msg_sig).await.unwrap();

        // a chain whose enact signature doesn't hold up is rejected
        let forged = vec![Key {
            id: k1.clone(),
            root: alice.clone(),
            parent: alice.clone(),
            enact_document: enact.clone(),
            enact_signature: sign(K2, enact.as_bytes(), Scheme::Bech32("con")).unwrap(),
            revoke_document: None,
            revoke_signature: None,
            valid_since: at(1000),
            valid_until: None,
        }];
        assert!(matches!(
            validate_key_resolution(&forged, &at(1200)),
            Err(Error::Signature { .. })
        ));

        // a genuine enact document can't be backdated by the peer serving it
        let honest = Key {
            id: k1.clone(),
            root: alice.clone(),
            parent: alice.clone(),
            enact_document: enact.clone(),
            enact_signature: enact_sig.clone(),
            revoke_document: None,
            revoke_signature: None,
            valid_since: at(1000),
            valid_until: None,
        };
        assert_eq!(
            validate_key_resolution(std::slice::from_ref(&honest), &at(1200)).unwrap(),
            alice
        );
        let backdated = Key {
            valid_since: at(500),
            ..honest.clone()
        };
        assert!(matches!(
            validate_key_resolution(&[backdated], &at(700)),
            Err(Error::EnactMismatch { field: "validSince", .. })
        ));

        // nor can a revocation be pushed into the future
        let (revoke, revoke_sig) = signed(
            json!({"signer": alice, "type": "revoke", "target": k1, "signedAt": at(1300)}),
            ALICE,
            &alice,
        );
        let postdated = Key {
            revoke_document: Some(revoke),
            revoke_signature: Some(revoke_sig),
            valid_until: Some(at(5000)),
            ..honest
        };
        assert!(matches!(
            validate_key_resolution(&[postdated], &at(2000)),
            Err(Error::EnactMismatch { field: "validUntil", .. })
        ));
    }
}
