//! Seed script for the Bulb store
//!
//! Creates a demo user (demo@bulb.app / demo123) and one starter collection
//! of truth and dare cards. Running it twice leaves the existing data alone.
//! Run: cargo run --bin load_data

use clap::Parser;
use std::path::PathBuf;

use bulb_server::auth::hash_password;
use bulb_server::models::{ActionType, NewAction, NewCollection, NewUser};
use bulb_server::storage::Storage;

const DEMO_EMAIL: &str = "demo@bulb.app";

#[derive(Parser)]
#[command(name = "load_data", about = "Seed a demo user and collection")]
struct Args {
    #[arg(long, env = "DATA_DIR", default_value = "bulb_data")]
    data_dir: PathBuf,
}

const CARDS: &[(&str, ActionType)] = &[
    ("What is the most embarrassing song on your playlist?", ActionType::Truth),
    ("Who in this room would you call at 3am?", ActionType::Truth),
    ("What is a habit you hide from everyone?", ActionType::Truth),
    ("Do your best impression of someone here.", ActionType::Dare),
    ("Speak only in questions until your next turn.", ActionType::Dare),
    ("Let the group post one sentence on your status.", ActionType::Dare),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let storage = Storage::open(&args.data_dir)?;

    if storage.find_user_by_email(DEMO_EMAIL)?.is_some() {
        println!("Demo user already present in {}; nothing to do.", args.data_dir.display());
        return Ok(());
    }

    let user = storage.create_user(NewUser {
        name: "Demo".to_string(),
        surname: "Player".to_string(),
        email: DEMO_EMAIL.to_string(),
        password_hash: hash_password("demo123")?,
        phone: String::new(),
    })?;

    let cards = CARDS
        .iter()
        .map(|(text, kind)| NewAction {
            text: text.to_string(),
            kind: *kind,
            order: 0,
        })
        .collect();
    let (collection, actions) = storage.create_collection_with_actions(
        user.id,
        NewCollection {
            name: "Party Starter".to_string(),
            description: "A warm-up mix of truths and dares".to_string(),
            image_url: String::new(),
        },
        cards,
    )?;
    storage.flush()?;

    println!(
        "Seeded user {} and collection {} with {} cards.",
        user.id,
        collection.id.0,
        actions.len()
    );
    Ok(())
}
