use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;

const TOKEN_FILE: &str = ".bulb_token";

#[derive(Parser)]
#[command(name = "bulb-cli")]
#[command(about = "CLI for the Bulb card collection API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, env = "BULB_URL", default_value = "http://localhost:8080")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        surname: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Exchange the saved refresh token for a new pair
    Refresh,
    Profile,
    /// List public collections, newest first
    Collections {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 10)]
        size: i64,
    },
    Trending {
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
    },
    MyCollections,
    Show {
        #[arg(short, long)]
        id: u64,
    },
    CreateCollection {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    RenameCollection {
        #[arg(short, long)]
        id: u64,
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    DeleteCollection {
        #[arg(short, long)]
        id: u64,
    },
    AddAction {
        #[arg(short = 'C', long = "collection")]
        collection_id: u64,
        #[arg(short, long)]
        text: String,
        /// truth or dare
        #[arg(short = 'k', long = "type")]
        kind: String,
        #[arg(short, long, default_value_t = 0)]
        order: u32,
    },
    RemoveAction {
        #[arg(short, long)]
        id: u64,
    },
    Play {
        #[arg(short, long)]
        id: u64,
    },
    Logout,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SavedTokens {
    access_token: String,
    refresh_token: String,
}

fn load_tokens() -> SavedTokens {
    fs::read_to_string(TOKEN_FILE)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn authorized(builder: RequestBuilder) -> RequestBuilder {
    builder.bearer_auth(load_tokens().access_token)
}

/// Saves the pair on success, prints the server's error otherwise.
async fn save_tokens(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    if res.status().is_success() {
        let tokens: SavedTokens = res.json().await?;
        fs::write(TOKEN_FILE, serde_json::to_string(&tokens)?)?;
        println!("Tokens saved to {}", TOKEN_FILE);
    } else {
        println!("Failed ({}): {}", res.status(), res.text().await?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let api = format!("{}/api", cli.url.trim_end_matches('/'));

    let res = match cli.command {
        Commands::Register { name, surname, email, password } => {
            let res = client
                .post(format!("{}/auth/register", api))
                .json(&json!({ "name": name, "surname": surname, "email": email, "password": password }))
                .send()
                .await?;
            return save_tokens(res).await;
        }
        Commands::Login { email, password } => {
            let res = client
                .post(format!("{}/auth/login", api))
                .json(&json!({ "email": email, "password": password }))
                .send()
                .await?;
            return save_tokens(res).await;
        }
        Commands::Refresh => {
            let res = client
                .post(format!("{}/auth/refresh", api))
                .json(&json!({ "refreshToken": load_tokens().refresh_token }))
                .send()
                .await?;
            return save_tokens(res).await;
        }
        Commands::Profile => authorized(client.get(format!("{}/user/profile", api))).send().await?,
        Commands::Collections { page, size } => {
            client
                .get(format!("{}/collections", api))
                .query(&[("page", page), ("size", size)])
                .send()
                .await?
        }
        Commands::Trending { limit } => {
            client
                .get(format!("{}/collections/trending", api))
                .query(&[("limit", limit)])
                .send()
                .await?
        }
        Commands::MyCollections => authorized(client.get(format!("{}/user/collections", api))).send().await?,
        Commands::Show { id } => client.get(format!("{}/collections/{}", api, id)).send().await?,
        Commands::CreateCollection { name, description } => {
            authorized(client.post(format!("{}/collections", api)))
                .json(&json!({ "name": name, "description": description }))
                .send()
                .await?
        }
        Commands::RenameCollection { id, name, description } => {
            authorized(client.put(format!("{}/collections/{}", api, id)))
                .json(&json!({ "name": name, "description": description }))
                .send()
                .await?
        }
        Commands::DeleteCollection { id } => {
            authorized(client.delete(format!("{}/collections/{}", api, id))).send().await?
        }
        Commands::AddAction { collection_id, text, kind, order } => {
            authorized(client.post(format!("{}/collections/{}/actions", api, collection_id)))
                .json(&json!({ "text": text, "type": kind, "order": order }))
                .send()
                .await?
        }
        Commands::RemoveAction { id } => {
            authorized(client.delete(format!("{}/actions/{}", api, id))).send().await?
        }
        Commands::Play { id } => client.post(format!("{}/collections/{}/play", api, id)).send().await?,
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Logged out (tokens removed).");
            return Ok(());
        }
    };

    println!("{} {}", res.status(), res.text().await?);
    Ok(())
}
