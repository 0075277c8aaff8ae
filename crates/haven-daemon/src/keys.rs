//! Node identity keys, persisted as hex seed files in the data directory.

use std::path::Path;

use anyhow::Context;
use rand::RngCore;

use haven_crypto::ed25519::KeyPair;
use haven_crypto::x25519::X25519SecretKey;

/// The node's long-term keys: the Ed25519 bus identity and the X25519 key
/// onion layers are encrypted to.
pub struct NodeKeys {
    pub ed25519: KeyPair,
    pub x25519: X25519SecretKey,
}

impl NodeKeys {
    /// Load both keys, generating and persisting any that are missing.
    pub fn load_or_create(dir: &Path) -> anyhow::Result<Self> {
        let ed_seed = load_or_create_seed(&dir.join("identity.key"))?;
        let x_seed = load_or_create_seed(&dir.join("onion.key"))?;
        Ok(Self {
            ed25519: KeyPair::from_bytes(&ed_seed),
            x25519: X25519SecretKey::from_bytes(x_seed),
        })
    }
}

fn load_or_create_seed(path: &Path) -> anyhow::Result<[u8; 32]> {
    if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let decoded = hex::decode(content.trim())
            .with_context(|| format!("decoding {}", path.display()))?;
        return <[u8; 32]>::try_from(decoded.as_slice())
            .map_err(|_| anyhow::anyhow!("{} is not a 32-byte seed", path.display()));
    }

    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    std::fs::write(path, hex::encode(seed))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(seed)
}
