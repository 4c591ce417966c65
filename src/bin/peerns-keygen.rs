//! Generates a fresh identity keypair and writes it to the overlay's
//! config-directory identity file, or prints its fingerprint if one
//! already exists. Meant for first-run provisioning and for operators
//! who want to inspect a device's identity without starting the
//! overlay itself.

use anyhow::Context;
use peerns_overlay::identity::Identity;
use peerns_overlay::storage::Storage;

fn main() -> anyhow::Result<()> {
    peerns_overlay::init_logging();

    let storage = Storage::open_default().context("could not open config directory")?;

    match storage
        .load_identity_bytes()
        .context("failed to read identity file")?
    {
        Some(existing) => {
            let identity =
                Identity::from_bytes(&existing).context("stored identity is corrupt")?;
            println!("existing identity found");
            println!("fingerprint: {}", identity.fingerprint());
        }
        None => {
            let identity = Identity::generate();
            storage
                .save_identity_bytes(&identity.to_bytes())
                .context("failed to save new identity")?;
            println!("generated new identity");
            println!("fingerprint: {}", identity.fingerprint());
            println!("config dir: {}", storage.root().display());
        }
    }

    Ok(())
}
