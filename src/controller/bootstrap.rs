//! Replica set bootstrap
//!
//! Runs once per application, on the coordinator: initiate the replica set
//! on this unit, create the operator user through the localhost exception,
//! then the backup and monitor users. The `db_initialised` flag is written
//! last, so a bootstrap interrupted at any step is simply run again.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::config::secrets::KEYFILE_NAME;
use crate::config::{CONF_DIR, KEY_FILE_NAME, MONGOSH_PATH, UNIX_GROUP, UNIX_USER};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::retry::RetryPolicy;
use crate::controller::users::{self, BACKUP, MONITOR, MongoUser, OPERATOR};
use crate::resources::secret::{generate_keyfile, generate_password};
use crate::resources::{FileOwner, Scope};

/// Length of generated user passwords
pub const PASSWORD_LENGTH: usize = 32;

/// Attempts for each user creation
const USER_CREATION_POLICY: RetryPolicy = RetryPolicy::fixed(3, Duration::from_secs(5));

/// Generate app secrets that do not exist yet; coordinator only
pub async fn generate_secrets(ctx: &Context) -> Result<()> {
    if !ctx.is_leader() {
        return Err(Error::NotCoordinator);
    }
    for user in [&OPERATOR, &MONITOR] {
        ensure_password(ctx, user).await?;
    }
    if ctx.secrets.get(Scope::App, KEYFILE_NAME).await?.is_none() {
        ctx.secrets
            .set(Scope::App, KEYFILE_NAME, &generate_keyfile())
            .await?;
        info!("Generated replica set keyfile");
    }
    Ok(())
}

/// Password of `user`, generated and stored when missing
async fn ensure_password(ctx: &Context, user: &MongoUser) -> Result<String> {
    let key = user.password_key();
    if let Some(password) = ctx.secrets.get(Scope::App, &key).await? {
        return Ok(password);
    }
    let password = generate_password(PASSWORD_LENGTH);
    ctx.secrets.set(Scope::App, &key, &password).await?;
    info!(user = %user.username, "Generated password");
    Ok(password)
}

/// Write the replica set keyfile into the workload
pub async fn push_keyfile(ctx: &Context) -> Result<()> {
    let keyfile = ctx
        .secrets
        .get(Scope::App, KEYFILE_NAME)
        .await?
        .ok_or_else(|| Error::MissingSecret(format!("{}:{}", Scope::App, KEYFILE_NAME)))?;
    ctx.workload
        .push(
            &format!("{}/{}", CONF_DIR, KEY_FILE_NAME),
            &keyfile,
            0o400,
            Some(&FileOwner::new(UNIX_USER, UNIX_GROUP)),
        )
        .await?;
    Ok(())
}

/// Initiate the replica set and create the internal users
///
/// No-op on non-coordinators and once the application is initialised.
#[instrument(skip(ctx), fields(unit = %ctx.unit))]
pub async fn initialise_replica_set(ctx: &Context) -> Result<()> {
    if !ctx.is_leader() || ctx.db_initialised().await? {
        return Ok(());
    }

    let local = ctx
        .user_config(&OPERATOR, BTreeSet::from([ctx.hostname()]))
        .await?;

    info!("Replica set initialising");
    ctx.driver
        .connect(&local, Some("localhost"), true)
        .init_replset()
        .await?;

    create_operator_user(ctx, &local.password).await?;
    create_user(ctx, &BACKUP).await?;
    create_user(ctx, &MONITOR).await?;

    ctx.set_db_initialised().await?;
    info!("Replica set initialised");
    Ok(())
}

/// Operator user via the localhost exception; the password goes on stdin
async fn create_operator_user(ctx: &Context, password: &str) -> Result<()> {
    if ctx.is_user_created(&OPERATOR).await? {
        debug!("Operator user already created");
        return Ok(());
    }
    let command = users::create_operator_user_command(MONGOSH_PATH);
    ctx.workload
        .exec(&command, &BTreeMap::new(), Some(password))
        .await?;
    ctx.set_user_created(&OPERATOR).await?;
    info!(user = %OPERATOR.username, "User created");
    Ok(())
}

/// Create `user` (and its custom role) through the operator connection
async fn create_user(ctx: &Context, user: &MongoUser) -> Result<()> {
    if ctx.is_user_created(user).await? {
        debug!(user = %user.username, "User already created");
        return Ok(());
    }

    let admin = ctx
        .user_config(&OPERATOR, BTreeSet::from([ctx.hostname()]))
        .await?;
    ensure_password(ctx, user).await?;
    let config = ctx
        .user_config(user, BTreeSet::from([ctx.hostname()]))
        .await?;

    USER_CREATION_POLICY
        .retry_all(ctx.sleeper.as_ref(), "user creation", || {
            let admin = &admin;
            let config = &config;
            async move {
                let conn = ctx.driver.connect(admin, None, false);
                if let Some(role) = user.custom_role {
                    conn.create_role(role.name, &role.privileges()).await?;
                }
                conn.create_user(config).await
            }
        })
        .await?;

    ctx.set_user_created(user).await?;
    info!(user = %user.username, "User created");
    Ok(())
}
