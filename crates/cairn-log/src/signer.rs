//! Root signing.
//!
//! [`RootSigner`] turns a tree head into a [`SignedLogRoot`] by signing the
//! canonical [`LogRoot`] encoding with a [`LogSigner`]. [`Ed25519Signer`] and
//! [`Ed25519Verifier`] are the provided implementations.

use std::sync::Arc;

use cairn_merkle::{LogHasher, MerkleTree, ProofBuilder};
use cairn_store::{LeafStore, LogNodes};
use cairn_types::{LogId, LogRoot, SignedLogRoot, TimeSource, TreeHead};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use tracing::debug;

use crate::error::LogError;

type Result<T> = std::result::Result<T, LogError>;

/// Signs root encodings.
pub trait LogSigner: Send + Sync {
    /// Sign `message`.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Encoded public key matching this signer.
    fn public_key(&self) -> Vec<u8>;
}

/// Checks root signatures.
pub trait LogVerifier: Send + Sync {
    /// Check `signature` over `message`.
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()>;

    /// Check the signature of a signed root over its canonical encoding.
    fn verify_root(&self, root: &SignedLogRoot) -> Result<()> {
        self.verify(&root.log_root().encode(), &root.signature)
    }
}

/// Ed25519 [`LogSigner`].
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// A signer from a 32-byte secret key.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(secret),
        }
    }

    /// A signer with a fresh random key.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::from_bytes(&secret)
    }

    /// The 32-byte secret key.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// The verifier for this signer's public key.
    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier {
            key: self.key.verifying_key(),
        }
    }
}

impl LogSigner for Ed25519Signer {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signature: Signature = self.key.sign(message);
        Ok(signature.to_bytes().to_vec())
    }

    fn public_key(&self) -> Vec<u8> {
        self.key.verifying_key().to_bytes().to_vec()
    }
}

/// Ed25519 [`LogVerifier`].
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    /// A verifier from a 32-byte public key.
    pub fn from_bytes(public: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = public
            .try_into()
            .map_err(|_| LogError::Signing(format!("public key has {} bytes", public.len())))?;
        let key =
            VerifyingKey::from_bytes(&bytes).map_err(|e| LogError::Signing(e.to_string()))?;
        Ok(Self { key })
    }
}

impl LogVerifier for Ed25519Verifier {
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let signature =
            Signature::from_slice(signature).map_err(|e| LogError::Signing(e.to_string()))?;
        self.key
            .verify(message, &signature)
            .map_err(|e| LogError::Signing(e.to_string()))
    }
}

/// Produces signed, timestamped commitments to tree heads.
pub struct RootSigner {
    signer: Arc<dyn LogSigner>,
    clock: Arc<dyn TimeSource>,
}

impl RootSigner {
    /// Sign with `signer`, stamping roots from `clock`.
    pub fn new(signer: Arc<dyn LogSigner>, clock: Arc<dyn TimeSource>) -> Self {
        Self { signer, clock }
    }

    /// The underlying signer.
    pub fn signer(&self) -> &Arc<dyn LogSigner> {
        &self.signer
    }

    /// Sign the root of the empty tree, revision 0.
    pub fn sign_empty(&self, log_id: LogId, hasher: &dyn LogHasher) -> Result<SignedLogRoot> {
        let head = TreeHead {
            size: 0,
            root_hash: hasher.empty_root(),
            revision: 0,
        };
        self.sign_head(log_id, &head)
    }

    /// Sign the current state of `tree` as the head at `revision`.
    ///
    /// The tree's frontier must have been loaded from stored nodes, so its
    /// root is justified by them plus the leaves appended since.
    pub fn sign_tree(
        &self,
        log_id: LogId,
        tree: &MerkleTree,
        revision: u64,
    ) -> Result<SignedLogRoot> {
        let head = TreeHead {
            size: tree.size(),
            root_hash: tree.root(),
            revision,
        };
        self.sign_head(log_id, &head)
    }

    /// Re-sign a committed head with a fresh timestamp at the next revision.
    ///
    /// Recomputes the root from the stored nodes first and refuses to sign
    /// if it does not match `head`.
    pub fn resign(
        &self,
        log_id: LogId,
        store: &dyn LeafStore,
        hasher: &dyn LogHasher,
        head: &TreeHead,
    ) -> Result<SignedLogRoot> {
        let nodes = LogNodes::new(store, log_id);
        let recomputed = ProofBuilder::new(hasher, &nodes, head.size).root(head.size)?;
        if recomputed != head.root_hash {
            return Err(LogError::Internal(format!(
                "log {log_id}: stored nodes give root {recomputed} at size {}, head says {}",
                head.size, head.root_hash
            )));
        }

        let next = TreeHead {
            revision: head.revision + 1,
            ..*head
        };
        self.sign_head(log_id, &next)
    }

    fn sign_head(&self, log_id: LogId, head: &TreeHead) -> Result<SignedLogRoot> {
        let root = LogRoot::from_head(head, self.clock.now_nanos());
        let signature = self.signer.sign(&root.encode())?;
        debug!(
            %log_id,
            tree_size = root.tree_size,
            revision = root.revision,
            root_hash = %root.root_hash,
            "signed log root"
        );
        Ok(SignedLogRoot::new(log_id, root, signature))
    }
}
