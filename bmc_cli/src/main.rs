#![deny(warnings)]

use clap::{Parser, Subcommand};
use log::Level;

use client::{AuthSession, BmcClient, ClientError, PowerAction, SessionStore};
use protos::bmc::manager::v1 as manager_protos;
use protos::bmc::v1 as common_protos;

#[derive(Parser)]
#[command(name = "bmc-cli")]
#[command(version = "0.0.1")]
#[command(about = "Operate servers through the BMC control plane.", long_about = None)]
struct Cli {
    /// Endpoint of the manager service.
    #[arg(long, env = "BMC_MANAGER_ENDPOINT", default_value = "http://127.0.0.1:8980")]
    manager_endpoint: String,

    /// Access token override; skips the stored session when set.
    #[arg(long, env = "BMC_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// The log level for this process's own logging: `info`, `warn`,
    /// `error`, `debug`, or `trace`.
    #[arg(short, long, env, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the stored login session.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },
    /// Operate on servers.
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
    /// Inspect regional gateways.
    Gateway {
        #[command(subcommand)]
        command: GatewayCommands,
    },
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Log in with email and password (prompted).
    Login { email: String },
    /// Forget the stored session.
    Logout,
}

#[derive(Clone, Subcommand)]
enum ServerCommands {
    /// List servers you own.
    List,
    /// Show one server.
    Show { id: String },
    /// Register a server by BMC endpoint.
    Register {
        /// BMC endpoint, e.g. 192.168.1.100:623 or https://10.0.0.9
        #[arg(long)]
        bmc_endpoint: String,
        #[arg(long)]
        datacenter_id: String,
        #[arg(long)]
        gateway_id: String,
        /// "ipmi" or "redfish".
        #[arg(long, default_value = "ipmi")]
        bmc_type: String,
        #[arg(long)]
        features: Vec<String>,
    },
    /// Power operations.
    Power {
        #[command(subcommand)]
        command: PowerCommands,
    },
    /// Open a serial console session.
    Console {
        id: String,
        /// Attach the local terminal in raw mode.
        #[arg(long)]
        terminal: bool,
    },
}

#[derive(Clone, Subcommand)]
enum PowerCommands {
    On { id: String },
    Off { id: String },
    Cycle { id: String },
    Reset { id: String },
    Status { id: String },
}

#[derive(Subcommand)]
enum GatewayCommands {
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level: Level = cli.log_level.parse().unwrap_or(Level::Warn);
    stderrlog::new()
        .show_module_names(true)
        .timestamp(stderrlog::Timestamp::Second)
        .verbosity(log_level)
        .init()
        .expect("initialize logging");

    if let Err(err) = run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<(), ClientError> {
    let store = SessionStore::new(SessionStore::default_path()?);

    match cli.command {
        Commands::Auth {
            command: AuthCommands::Login { email },
        } => {
            let password = rpassword::prompt_password("Password: ")
                .map_err(|err| ClientError::Internal(format!("failed to read password: {err}")))?;
            let (session, customer) =
                BmcClient::login(&cli.manager_endpoint, &email, &password).await?;
            store.save(&session)?;
            println!("Logged in as {} ({})", customer.email, customer.id);
            if let Some(expires_at) = session.expires_at {
                println!("Session valid until {expires_at}");
            }
            Ok(())
        }
        Commands::Auth {
            command: AuthCommands::Logout,
        } => {
            store.clear()?;
            println!("Logged out.");
            Ok(())
        }
        Commands::Server { ref command } => {
            let mut client = connected_client(&cli, &store).await?;
            run_server_command(&mut client, command.clone()).await
        }
        Commands::Gateway {
            command: GatewayCommands::List,
        } => {
            let mut client = connected_client(&cli, &store).await?;
            for gateway in client.list_gateways().await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    gateway.id,
                    gateway.region,
                    gateway.endpoint,
                    gateway.datacenter_ids.join(","),
                    gateway.status,
                );
            }
            Ok(())
        }
    }
}

/// Build an orchestrator from the stored session (or the token override),
/// refreshing a just-expired access token when possible.
async fn connected_client(cli: &Cli, store: &SessionStore) -> Result<BmcClient, ClientError> {
    let session = match &cli.auth_token {
        Some(token) => AuthSession {
            access_token: token.clone(),
            ..Default::default()
        },
        None => store.load()?.ok_or(ClientError::AuthMissing)?,
    };

    let needs_refresh = session.ensure_valid_token() == Err(ClientError::AuthExpired)
        && !session.refresh_token.is_empty();
    let mut client = BmcClient::connect(&cli.manager_endpoint, session).await?;
    if needs_refresh {
        client.refresh().await?;
        store.save(client.session())?;
        log::info!("access token refreshed");
    }
    Ok(client)
}

async fn run_server_command(
    client: &mut BmcClient,
    command: ServerCommands,
) -> Result<(), ClientError> {
    match command {
        ServerCommands::List => {
            for server in client.list_servers().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    server.id,
                    server.datacenter_id,
                    endpoint_type_name(server.primary_protocol),
                    server.status,
                );
            }
            Ok(())
        }
        ServerCommands::Show { id } => {
            let server = client.get_server(&id).await?;
            print_server(&server);
            Ok(())
        }
        ServerCommands::Register {
            bmc_endpoint,
            datacenter_id,
            gateway_id,
            bmc_type,
            features,
        } => {
            let bmc_type: model::EndpointType =
                bmc_type.parse().map_err(ClientError::Config)?;
            let server_id = client
                .register_server(manager_protos::RegisterServerRequest {
                    server_id: String::new(),
                    customer_id: String::new(),
                    datacenter_id,
                    gateway_id,
                    bmc_type: common_protos::EndpointType::from(bmc_type) as i32,
                    features,
                    bmc_endpoint,
                })
                .await?;
            println!("Registered {server_id}");
            Ok(())
        }
        ServerCommands::Power { command } => {
            let (id, action) = match command {
                PowerCommands::On { id } => (id, Some(PowerAction::On)),
                PowerCommands::Off { id } => (id, Some(PowerAction::Off)),
                PowerCommands::Cycle { id } => (id, Some(PowerAction::Cycle)),
                PowerCommands::Reset { id } => (id, Some(PowerAction::Reset)),
                PowerCommands::Status { id } => (id, None),
            };
            match action {
                Some(action) => {
                    client.power(&id, action).await?;
                    println!("ok");
                }
                None => {
                    let state = client.power_status(&id).await?;
                    println!("{state}");
                }
            }
            Ok(())
        }
        ServerCommands::Console { id, terminal } => {
            if terminal {
                let connection = client.open_console(&id).await?;
                client::terminal::run_console(connection, true).await
            } else {
                let session = client.create_sol_session(&id).await?;
                println!("session_id: {}", session.session_id);
                println!("websocket:  {}", session.websocket_endpoint);
                println!("expires_at: {}", session.expires_at);
                Ok(())
            }
        }
    }
}

fn endpoint_type_name(value: i32) -> &'static str {
    match common_protos::EndpointType::from_i32(value) {
        Some(common_protos::EndpointType::Ipmi) => "ipmi",
        Some(common_protos::EndpointType::Redfish) => "redfish",
        _ => "unknown",
    }
}

fn print_server(server: &common_protos::Server) {
    println!("id:          {}", server.id);
    println!("customer:    {}", server.customer_id);
    println!("datacenter:  {}", server.datacenter_id);
    println!(
        "protocol:    {}",
        endpoint_type_name(server.primary_protocol)
    );
    println!("status:      {}", server.status);
    for endpoint in &server.control_endpoints {
        println!(
            "endpoint:    {} ({})",
            endpoint.endpoint,
            endpoint_type_name(endpoint.r#type)
        );
    }
    if let Some(sol) = &server.sol_endpoint {
        println!("sol:         {}", sol.endpoint);
    }
    if let Some(vnc) = &server.vnc_endpoint {
        println!("vnc:         {}", vnc.endpoint);
    }
    if !server.features.is_empty() {
        println!("features:    {}", server.features.join(", "));
    }
    if let Some(discovery) = &server.discovery_metadata {
        println!(
            "discovered:  {} via {}",
            discovery.discovery_source, discovery.discovery_method
        );
    }
}
