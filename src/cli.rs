//! Command-line surface and dispatch.

use anyhow::Result;
use clap::{ArgAction, Args, Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Table};
use tracing::info;
use zeroize::Zeroizing;

use crate::api::{ConsoleClient, CONSOLE_BASE_URL};
use crate::auth::Credentials;

#[derive(Parser, Debug)]
#[command(name = "citus-cloud-mgmt", version, about = "Manage Citus Cloud database roles")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct ClientOpts {
    /// Citus Cloud user email
    #[arg(long, short = 'u', env = "CITUS_CLOUD_USER")]
    pub user: String,

    /// Citus Cloud user password
    #[arg(long, short = 'p', env = "CITUS_CLOUD_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Citus Cloud TOTP 2FA secret
    #[arg(long, short = 't', env = "CITUS_CLOUD_TOTP_SECRET", hide_env_values = true)]
    pub totp: String,

    /// Prefix for files to store cookies; no prefix disables persistence
    #[arg(long, env = "CITUS_CLOUD_COOKIES")]
    pub cookies: Option<String>,
}

impl ClientOpts {
    fn client(&self) -> Result<ConsoleClient> {
        let credentials = Credentials {
            user: self.user.clone(),
            password: Zeroizing::new(self.password.clone()),
            totp_secret: Zeroizing::new(self.totp.clone()),
        };
        Ok(ConsoleClient::new(
            CONSOLE_BASE_URL,
            credentials,
            self.cookies.as_deref(),
        )?)
    }
}

#[derive(Args, Debug)]
pub struct FormationOpts {
    #[command(flatten)]
    pub client: ClientOpts,

    /// Citus Cloud formation id
    #[arg(long, short = 'f', env = "CITUS_CLOUD_FORMATION")]
    pub formation: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify ability to sign in to Citus Cloud
    Login(ClientOpts),

    /// Manage roles
    #[command(subcommand)]
    Role(RoleCommands),
}

#[derive(Subcommand, Debug)]
pub enum RoleCommands {
    /// List roles for the given formation
    List(FormationOpts),

    /// Create a new role named NAME for the given formation
    Create {
        #[command(flatten)]
        opts: FormationOpts,
        name: String,
    },

    /// Delete the role with the given ID for the given formation
    Delete {
        #[command(flatten)]
        opts: FormationOpts,
        id: String,
    },

    /// Get Postgres credentials for the role with the given ID
    GetCred {
        #[command(flatten)]
        opts: FormationOpts,
        id: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Login(opts) => {
                opts.client()?.login().await?;
                info!("successfully logged in");
            }
            Commands::Role(RoleCommands::List(opts)) => {
                let roles = opts.client.client()?.list_roles(&opts.formation).await?;

                let mut table = Table::new();
                table.load_preset(UTF8_FULL);
                table.set_header(vec![
                    Cell::new("Name").add_attribute(Attribute::Bold),
                    Cell::new("Id").add_attribute(Attribute::Bold),
                ]);
                for role in roles {
                    table.add_row(vec![role.name, role.id]);
                }
                println!("{table}");
            }
            Commands::Role(RoleCommands::Create { opts, name }) => {
                let id = opts.client.client()?.create_role(&opts.formation, &name).await?;
                info!(name = %name, id = %id, "created role");
                println!("{id}");
            }
            Commands::Role(RoleCommands::Delete { opts, id }) => {
                opts.client.client()?.delete_role(&opts.formation, &id).await?;
                info!(id = %id, "deleted role");
            }
            Commands::Role(RoleCommands::GetCred { opts, id }) => {
                let creds = opts
                    .client
                    .client()?
                    .get_role_credentials(&opts.formation, &id)
                    .await?;
                println!("{creds}");
            }
        }
        Ok(())
    }
}
