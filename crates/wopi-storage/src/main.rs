mod config;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config};
use wopi_storage::{
    Authorization, LockContext, MetadataDetails, StorageBackend, StorageFactory, StorageMetadata,
    UploadRequest,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let settings = config.load_settings()?;
    let factory = StorageFactory::new(settings)?;
    let auth = config.authorization();

    info!("Opening document storage");
    info!("  Jail root: {}", config.jail_root.display());
    info!("  Jail path: {}", config.jail_path.display());

    let mut storage = factory
        .create(
            config.command.location(),
            &config.jail_root,
            &config.jail_path,
            false,
        )
        .await?;

    let output = match &config.command {
        Command::CheckFileInfo { .. } => {
            let mut lock_ctx = factory.new_lock_context();
            let metadata = storage.fetch_metadata(&auth, &mut lock_ctx).await?;
            metadata_json(&metadata, &lock_ctx)
        }
        Command::GetFile { template, .. } => {
            let mut lock_ctx = factory.new_lock_context();
            storage.fetch_metadata(&auth, &mut lock_ctx).await?;
            let jailed = storage
                .materialize_local(&auth, &lock_ctx, template.as_deref())
                .await?;
            json!({
                "local_path": storage.base().root_file_path(),
                "jailed_path": jailed,
            })
        }
        Command::Lock { lock_token, .. } => {
            let mut lock_ctx = lock_context(&factory, lock_token.as_deref());
            update_lock(storage.as_mut(), &auth, &mut lock_ctx, true).await?
        }
        Command::Unlock { lock_token, .. } => {
            let mut lock_ctx = lock_context(&factory, Some(lock_token.as_str()));
            update_lock(storage.as_mut(), &auth, &mut lock_ctx, false).await?
        }
        Command::PutFile {
            source,
            save_as,
            rename,
            force,
            lock_token,
            ..
        } => {
            let mut lock_ctx = lock_context(&factory, lock_token.as_deref());
            storage.fetch_metadata(&auth, &mut lock_ctx).await?;
            storage.materialize_local(&auth, &lock_ctx, None).await?;

            let request = match (save_as, rename) {
                (Some(filename), _) => UploadRequest::SaveAs {
                    path: source.clone(),
                    filename: filename.into(),
                },
                (None, rename) => {
                    // Saves upload the working copy's ".uploading" sibling.
                    let working = storage.base().root_file_path().to_path_buf();
                    tokio::fs::copy(source, &working)
                        .await
                        .with_context(|| format!("Failed to copy {}", source.display()))?;
                    tokio::fs::copy(&working, storage.base().root_file_path_uploading())
                        .await
                        .context("Failed to stage the upload")?;
                    match rename {
                        Some(filename) => UploadRequest::Rename {
                            filename: filename.into(),
                        },
                        None => UploadRequest::Save,
                    }
                }
            };

            if *force {
                storage.base().set_force_save(true);
            }
            storage.base_mut().set_save_flags(true, false, false, "");
            let result = storage.upload_sync(&auth, &lock_ctx, &request).await;

            let uploading = storage.base().root_file_path_uploading();
            if let Err(e) = tokio::fs::remove_file(&uploading).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", uploading.display(), e);
                }
            }

            if !result.is_ok() {
                bail!("Upload failed: {} {}", result.kind, result.reason);
            }
            json!({
                "result": result.kind.to_string(),
                "name": result.save_as_name,
                "url": result.save_as_url,
                "last_modified_time": storage.base().file_info().last_modified_time,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn lock_context(factory: &StorageFactory, token: Option<&str>) -> LockContext {
    match token {
        Some(token) => LockContext::with_token(factory.settings().lock_refresh_interval(), token),
        None => factory.new_lock_context(),
    }
}

async fn update_lock(
    storage: &mut dyn StorageBackend,
    auth: &Authorization,
    lock_ctx: &mut LockContext,
    lock: bool,
) -> anyhow::Result<Value> {
    storage.fetch_metadata(auth, lock_ctx).await?;
    if !lock_ctx.supports_locks() {
        warn!("The storage host does not support locks");
    } else if !storage.update_lock(auth, lock_ctx, lock).await {
        bail!(
            "{} failed: {}",
            if lock { "Lock" } else { "Unlock" },
            lock_ctx.failure_reason()
        );
    }

    Ok(json!({
        "supports_locks": lock_ctx.supports_locks(),
        "locked": lock_ctx.is_locked(),
        "lock_token": lock_ctx.supports_locks().then(|| lock_ctx.lock_token().to_string()),
    }))
}

fn metadata_json(metadata: &StorageMetadata, lock_ctx: &LockContext) -> Value {
    let mut output = json!({
        "filename": metadata.file_info.filename,
        "owner_id": metadata.file_info.owner_id,
        "last_modified_time": metadata.file_info.last_modified_time,
        "user_id": metadata.user_id(),
        "username": metadata.username(),
        "supports_locks": lock_ctx.supports_locks(),
    });

    match &metadata.details {
        MetadataDetails::Local(local) => {
            output["size"] = json!(local.size);
        }
        MetadataDetails::Wopi(wopi) => {
            output["size"] = json!(wopi.size);
            output["user_can_write"] = json!(wopi.user_can_write);
            output["user_can_rename"] = json!(wopi.user_can_rename);
            output["supports_rename"] = json!(wopi.supports_rename);
            output["disable_export"] = json!(wopi.disable_export);
            output["watermark_text"] = json!(wopi.watermark_text);
        }
    }
    output
}
