use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Client for the agglomerator HTTP API", long_about = None)]
struct Cli {
    /// Base URL of the node's API.
    #[clap(long, default_value = "http://127.0.0.1:8080")]
    host: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage registered chains.
    Chain {
        #[clap(subcommand)]
        action: ChainAction,
    },
    /// Submit transactions.
    Tx {
        #[clap(subcommand)]
        action: TxAction,
    },
    /// Show module state.
    Status,
    /// Stop accepting transactions.
    Pause,
    /// Accept transactions again.
    Resume,
}

#[derive(Subcommand, Debug)]
enum ChainAction {
    List,
    Get {
        id: String,
    },
    Add {
        id: String,
        #[clap(long)]
        protocol: String,
        #[clap(long, default_value = "")]
        endpoint: String,
    },
}

#[derive(Subcommand, Debug)]
enum TxAction {
    Create {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
        #[clap(long)]
        payload: Option<String>,
        #[clap(long)]
        threshold: Option<f64>,
        /// Route across the peer network instead of the local registry.
        #[clap(long)]
        network: bool,
    },
}

struct Client {
    http: reqwest::Client,
    base: String,
}

impl Client {
    fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, String> {
        let resp = self
        .http
        .get(format!("{}{}", self.base, path))
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
        read_body(resp).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, String> {
        let mut req = self.http.post(format!("{}{}", self.base, path));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| format!("request failed: {e}"))?;
        read_body(resp).await
    }
}

async fn read_body(resp: reqwest::Response) -> Result<Value, String> {
    let status = resp.status();
    let body: Value = resp
    .json()
    .await
    .map_err(|e| format!("unreadable response ({status}): {e}"))?;
    if status.is_success() {
        Ok(body)
    } else {
        let reason = body["error"].as_str().unwrap_or("unknown error");
        Err(format!("{status}: {reason}"))
    }
}

fn print_chain(chain: &Value) {
    println!(
        "{:<16} {:<8} {:<32} pending={}",
        chain["id"].as_str().unwrap_or("?"),
        chain["protocol"].as_str().unwrap_or("?"),
        chain["endpoint"].as_str().unwrap_or(""),
        chain["pending"]
    );
}

async fn execute(client: &Client, command: Command) -> Result<(), String> {
    match command {
        Command::Chain { action: ChainAction::List } => {
            let chains = client.get("/chains").await?;
            let list = chains.as_array().cloned().unwrap_or_default();
            if list.is_empty() {
                println!("No chains registered.");
            }
            list.iter().for_each(print_chain);
        }
        Command::Chain { action: ChainAction::Get { id } } => {
            print_chain(&client.get(&format!("/chains/{id}")).await?);
        }
        Command::Chain { action: ChainAction::Add { id, protocol, endpoint } } => {
            let body = json!({ "id": id, "protocol": protocol, "endpoint": endpoint });
            let chain = client.post("/chains", Some(body)).await?;
            println!("[\u{2713}] Registered chain");
            print_chain(&chain);
        }
        Command::Tx { action: TxAction::Create { from, to, payload, threshold, network } } => {
            let id = Uuid::new_v4().to_string();
            let body = json!({
                "id": id,
                "from_chain": from,
                "to_chain": to,
                "payload": payload,
                "similarity_threshold": threshold,
                "routing": if network { "network" } else { "local" },
            });
            let reply = client.post("/transaction", Some(body)).await?;
            println!("[\u{2713}] Transaction {} routed via {}", id, reply["route"]);
        }
        Command::Status => {
            let status = client.get("/status").await?;
            println!("{}", serde_json::to_string_pretty(&status).unwrap_or_default());
        }
        Command::Pause => {
            client.post("/pause", None).await?;
            println!("[\u{2713}] Module paused");
        }
        Command::Resume => {
            client.post("/resume", None).await?;
            println!("[\u{2713}] Module resumed");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = Client::new(&cli.host);

    if let Err(e) = execute(&client, cli.command).await {
        eprintln!("[\u{2717} Error] {}", e);
        std::process::exit(1);
    }
}
