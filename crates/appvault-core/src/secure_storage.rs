use anyhow::{anyhow, Result};
use keyring::Entry;
use zeroize::Zeroizing;

use crate::crypto::SharedSecret;

const SERVICE_NAME: &str = "AppVault";
const SECRET_KEY: &str = "artifact_secret";
pub const SECRET_ENV: &str = "APPVAULT_SECRET";

pub fn store_shared_secret(secret: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(anyhow!("refusing to store an empty secret"));
    }
    let entry = Entry::new(SERVICE_NAME, SECRET_KEY).map_err(|e| anyhow!("keyring init: {e}"))?;
    entry
        .set_password(secret)
        .map_err(|e| anyhow!("store secret: {e}"))?;
    Ok(())
}

pub fn delete_shared_secret() -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, SECRET_KEY).map_err(|e| anyhow!("keyring init: {e}"))?;
    entry
        .delete_password()
        .map_err(|e| anyhow!("delete secret: {e}"))?;
    Ok(())
}

/// `APPVAULT_SECRET` wins over the keyring so headless installs and tests
/// can run without a credential store.
pub fn load_shared_secret() -> Result<SharedSecret> {
    let raw = match std::env::var(SECRET_ENV) {
        Ok(value) => Zeroizing::new(value),
        Err(_) => {
            let entry =
                Entry::new(SERVICE_NAME, SECRET_KEY).map_err(|e| anyhow!("keyring init: {e}"))?;
            Zeroizing::new(
                entry
                    .get_password()
                    .map_err(|e| anyhow!("load secret (run `appvault secret set`): {e}"))?,
            )
        }
    };
    if raw.is_empty() {
        return Err(anyhow!("shared secret is empty"));
    }
    Ok(SharedSecret::new(raw.as_bytes()))
}
