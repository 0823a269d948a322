#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use futures::StreamExt;
use log::{debug, error, info};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

mod utils;

use barberline::{
    config::{set_config_path_override, ClientConfig},
    models::{
        format_price, AuthUser, ChatMessage, Location, MessageKind, NearbyBarber, OfferStatus,
        SavedAddress, SelectedBarber, SelectedService, TABLE_BARBERS, TABLE_BARBER_RESPONSES,
        TABLE_SERVICE_REQUESTS,
    },
    store::{AppState, BookingState, FileStorage, MemoryStorage, SearchHistory, UserMode, UserState},
    Backend, BackendError, BookingClient, LocalStores, MemoryBackend,
};

/// Command line arguments for Barberline
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Barberline: local state and live sync for the barber marketplace client.",
    long_about = "Barberline inspects and edits the persisted client stores and can run a \
    simulated booking session against an in-process backend.\n\n\
    Optional parameters:\n\
    --data-dir <PATH>     Override the directory holding the persisted stores\n\
    --config <PATH>       Read configuration from this file\n\
    Use -h or --help to see all options."
)]
struct Args {
    /// Directory holding the persisted stores
    #[arg(long, value_name = "PATH", global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file to read instead of the default location
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// App mode, presence and onboarding flags
    Mode {
        #[command(subcommand)]
        action: Option<ModeAction>,
    },
    /// The booking draft
    Booking {
        #[command(subcommand)]
        action: Option<BookingAction>,
    },
    /// Location, saved addresses and language
    User {
        #[command(subcommand)]
        action: Option<UserAction>,
    },
    /// Recent searches
    Search {
        #[command(subcommand)]
        action: Option<SearchAction>,
    },
    /// Run a simulated booking session against an in-process backend
    Demo {
        /// Polling interval for the request watcher
        #[arg(long, default_value_t = 250)]
        poll_interval_ms: u64,
        /// Delay between simulated barber actions
        #[arg(long, default_value_t = 400)]
        step_ms: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ModeAction {
    Show,
    Set { mode: UserMode },
    Toggle,
    Online {
        #[arg(action = ArgAction::Set)]
        online: bool,
    },
    Onboarded,
}

#[derive(Subcommand, Debug)]
enum BookingAction {
    Show,
    AddService {
        id: String,
        name: String,
        #[arg(long)]
        price_cents: i64,
        #[arg(long, default_value_t = 30)]
        duration_minutes: u32,
    },
    RemoveService { id: String },
    Barber {
        id: String,
        name: String,
        #[arg(long)]
        rating: Option<f32>,
    },
    ClearBarber,
    /// Set the notes for the barber; omit to clear them
    Notes { notes: Option<String> },
    Reset,
}

#[derive(Subcommand, Debug)]
enum UserAction {
    Show,
    #[command(allow_negative_numbers = true)]
    Locate {
        latitude: f64,
        longitude: f64,
        #[arg(long)]
        label: Option<String>,
    },
    #[command(allow_negative_numbers = true)]
    AddAddress {
        id: String,
        label: String,
        address: String,
        latitude: f64,
        longitude: f64,
    },
    RemoveAddress { id: String },
    Language { code: String },
}

#[derive(Subcommand, Debug)]
enum SearchAction {
    List,
    Add { term: String },
    Remove { term: String },
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments FIRST
    let args = Args::parse();

    if let Some(path) = &args.config {
        set_config_path_override(path.clone());
    }
    let mut config = ClientConfig::load()?;
    if let Some(dir) = &args.data_dir {
        config.data_dir = Some(dir.clone());
    }

    utils::setup_logging(config.log_file.as_deref(), config.log_level_filter())?;
    debug!("Effective configuration: {:?}", config);

    let result = match args.command {
        Command::Demo { poll_interval_ms, step_ms } => {
            config.poll_interval_ms = poll_interval_ms;
            run_demo(config, Duration::from_millis(step_ms)).await
        }
        command => {
            let data_dir = config.data_dir()?;
            info!("Using data directory {}", data_dir.display());
            let stores = LocalStores::open(Arc::new(FileStorage::new(data_dir)));
            run_store_command(&stores, command)
        }
    };

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}

fn run_store_command(stores: &LocalStores, command: Command) -> Result<()> {
    match command {
        Command::Mode { action } => {
            let state = match action.unwrap_or(ModeAction::Show) {
                ModeAction::Show => stores.app.snapshot(),
                ModeAction::Set { mode } => stores.app.set_user_mode(mode)?,
                ModeAction::Toggle => stores.app.toggle_user_mode()?,
                ModeAction::Online { online } => stores.app.set_online(online)?,
                ModeAction::Onboarded => stores.app.set_onboarding_complete(true)?,
            };
            print_app(&state);
        }
        Command::Booking { action } => {
            let state = match action.unwrap_or(BookingAction::Show) {
                BookingAction::Show => stores.booking.snapshot(),
                BookingAction::AddService { id, name, price_cents, duration_minutes } => {
                    stores.booking.add_service(SelectedService { id, name, price_cents, duration_minutes })?
                }
                BookingAction::RemoveService { id } => stores.booking.remove_service(&id)?,
                BookingAction::Barber { id, name, rating } => {
                    stores.booking.set_selected_barber(SelectedBarber { id, name, rating })?
                }
                BookingAction::ClearBarber => stores.booking.clear_selected_barber()?,
                BookingAction::Notes { notes } => stores.booking.set_notes(notes)?,
                BookingAction::Reset => stores.booking.reset_booking()?,
            };
            print_booking(&state);
        }
        Command::User { action } => {
            let state = match action.unwrap_or(UserAction::Show) {
                UserAction::Show => stores.user.snapshot(),
                UserAction::Locate { latitude, longitude, label } => {
                    stores.user.set_current_location(Location { latitude, longitude, label })?
                }
                UserAction::AddAddress { id, label, address, latitude, longitude } => {
                    let location = Location {
                        latitude,
                        longitude,
                        label: Some(label.clone()),
                    };
                    stores.user.add_saved_address(SavedAddress { id, label, address, location })?
                }
                UserAction::RemoveAddress { id } => stores.user.remove_saved_address(&id)?,
                UserAction::Language { code } => stores.user.set_language(&code)?,
            };
            print_user(&state);
        }
        Command::Search { action } => {
            let state = match action.unwrap_or(SearchAction::List) {
                SearchAction::List => stores.searches.snapshot(),
                SearchAction::Add { term } => stores.searches.add_search(&term)?,
                SearchAction::Remove { term } => stores.searches.remove_search(&term)?,
                SearchAction::Clear => stores.searches.clear()?,
            };
            print_searches(&state);
        }
        Command::Demo { .. } => return Err(anyhow!("demo does not use the persisted stores")),
    }
    Ok(())
}

fn print_app(state: &AppState) {
    println!("mode:       {}", state.user_mode);
    println!("online:     {}", state.is_online);
    println!("onboarded:  {}", state.has_completed_onboarding);
}

fn print_booking(state: &BookingState) {
    if state.selected_services.is_empty() {
        println!("No services selected");
    }
    for service in &state.selected_services {
        println!(
            "  [{}] {} {} ({} min)",
            service.id,
            service.name,
            format_price(service.price_cents),
            service.duration_minutes
        );
    }
    println!(
        "total:  {} / {} min",
        format_price(state.total_price_cents()),
        state.total_duration_minutes()
    );
    match &state.selected_barber {
        Some(barber) => println!("barber: {} ({})", barber.name, barber.id),
        None => println!("barber: any"),
    }
    if let Some(notes) = &state.notes {
        println!("notes:  {}", notes);
    }
}

fn print_user(state: &UserState) {
    match &state.current_location {
        Some(location) => println!(
            "location: {:.5}, {:.5} {}",
            location.latitude,
            location.longitude,
            location.label.as_deref().unwrap_or("")
        ),
        None => println!("location: not set"),
    }
    println!("language: {}", state.language);
    for address in &state.saved_addresses {
        println!("  [{}] {}: {}", address.id, address.label, address.address);
    }
}

fn print_searches(state: &SearchHistory) {
    if state.terms.is_empty() {
        println!("No recent searches");
    }
    for (i, term) in state.terms.iter().enumerate() {
        println!("{:>2}. {}", i + 1, term);
    }
}

fn print_message(message: &ChatMessage) {
    let time = message.created_at.format("%H:%M:%S");
    match (message.kind, message.offer_status) {
        (MessageKind::Offer, Some(status)) => println!(
            "  {} {:?} offers {} [{:?}]",
            time, message.sender_role, message.content, status
        ),
        _ => println!("  {} {:?}: {}", time, message.sender_role, message.content),
    }
}

// A few barbers spread around lower Manhattan
fn seed_barbers(backend: &MemoryBackend) {
    backend.seed(
        TABLE_BARBERS,
        vec![
            json!({"id": "b-ana", "name": "Ana's Chair", "rating": 4.9, "latitude": 40.7150, "longitude": -74.0090}),
            json!({"id": "b-marco", "name": "Marco Fades", "rating": 4.6, "latitude": 40.7230, "longitude": -73.9980}),
            json!({"id": "b-lee", "name": "Lee Cuts", "rating": 4.7, "latitude": 40.7410, "longitude": -73.9890}),
            json!({"id": "b-far", "name": "Upstate Shears", "rating": 4.2, "latitude": 42.6526, "longitude": -73.7562}),
        ],
    );
}

// Plays the barber side: responses arrive, the request is matched and then accepted.
async fn simulate_barbers(
    backend: MemoryBackend,
    request_id: String,
    barbers: Vec<NearbyBarber>,
    step: Duration,
) -> Result<(), BackendError> {
    sleep(step).await;
    backend
        .update(TABLE_SERVICE_REQUESTS, &request_id, json!({"status": "matching"}))
        .await?;

    for (i, barber) in barbers.iter().enumerate() {
        sleep(step).await;
        backend
            .insert(
                TABLE_BARBER_RESPONSES,
                json!({
                    "request_id": request_id,
                    "barber_id": barber.id,
                    "price_cents": 3000 + 500 * i as i64,
                    "eta_minutes": 10 + 5 * i as u32,
                    "note": format!("{} can be there soon", barber.name),
                }),
            )
            .await?;
    }

    sleep(step).await;
    let chosen = barbers.first().map(|b| b.id.clone());
    backend
        .update(
            TABLE_SERVICE_REQUESTS,
            &request_id,
            json!({"status": "accepted", "barber_id": chosen}),
        )
        .await?;
    Ok(())
}

async fn run_demo(config: ClientConfig, step: Duration) -> Result<()> {
    let customer = AuthUser {
        id: "demo-customer".to_string(),
        email: Some("customer@example.com".to_string()),
    };
    let barber = AuthUser {
        id: "b-ana".to_string(),
        email: None,
    };

    let backend = MemoryBackend::with_user(customer.clone());
    backend.set_channel_capacity(config.channel_capacity);
    seed_barbers(&backend);

    // The demo never touches the persisted stores
    let client = BookingClient::new(Arc::new(backend.clone()), Arc::new(MemoryStorage::new()), config);
    let stores = client.stores();

    stores.user.set_current_location(Location {
        latitude: 40.7128,
        longitude: -74.0060,
        label: Some("City Hall".to_string()),
    })?;
    let nearby = client.nearby_barbers().await?;
    println!("Barbers within {} km:", client.config().nearby_radius_km);
    for barber in &nearby {
        println!("  {} ({:.1} km)", barber.name, barber.distance_km);
    }

    stores.booking.add_service(SelectedService {
        id: "svc-cut".to_string(),
        name: "Haircut".to_string(),
        price_cents: 3000,
        duration_minutes: 30,
    })?;
    stores.booking.add_service(SelectedService {
        id: "svc-beard".to_string(),
        name: "Beard trim".to_string(),
        price_cents: 1500,
        duration_minutes: 15,
    })?;
    stores.booking.set_notes(Some("Buzz the side door".to_string()))?;

    let request = client.create_request(None).await?;
    println!("Posted request {} ({})", request.id, request.status.as_str());

    // Request status
    let watch = client.watch_request(&request.id);
    let simulator = tokio::spawn(simulate_barbers(
        backend.clone(),
        request.id.clone(),
        nearby.clone(),
        step,
    ));

    let mut updates = watch.subscribe();
    let wait_for_terminal = async {
        let mut last_seen = None;
        loop {
            let snapshot = updates.borrow_and_update().clone();
            let seen = (snapshot.status(), snapshot.response_count);
            if last_seen != Some(seen) {
                if let Some(status) = snapshot.status() {
                    println!(
                        "Request {} is {} with {} responses ({:?})",
                        snapshot.request_id,
                        status.as_str(),
                        snapshot.response_count,
                        snapshot.poll_state
                    );
                }
                last_seen = Some(seen);
            }
            if matches!(snapshot.status(), Some(status) if !status.is_active()) {
                return Ok(snapshot);
            }
            if updates.changed().await.is_err() {
                return Err(anyhow!("request watcher stopped"));
            }
        }
    };
    let settled = timeout(step * 20, wait_for_terminal)
        .await
        .map_err(|_| anyhow!("request {} did not settle in time", request.id))??;
    simulator.await??;

    if let Some(data) = &settled.data {
        for response in &data.responses {
            println!(
                "  {} offered {} with eta {} min",
                response.barber_id,
                format_price(response.price_cents),
                response.eta_minutes
            );
        }
    }

    // Chat
    let chat = client.watch_chat(Some(&request.id));
    let mut stream = chat.stream();
    let printer = tokio::spawn(async move {
        let mut shown = 0;
        while let Some(snapshot) = stream.next().await {
            for message in snapshot.messages.iter().skip(shown) {
                print_message(message);
            }
            shown = snapshot.messages.len();
        }
    });

    let mut chat_updates = chat.subscribe();
    timeout(step * 10, chat_updates.wait_for(|s| s.is_loaded))
        .await
        .map_err(|_| anyhow!("chat did not load in time"))??;

    client.send_text(&request.id, "Hi! Can you make it by 5pm?").await?;

    backend.sign_in(barber);
    stores.app.set_user_mode(UserMode::Barber)?;
    client.send_text(&request.id, "Sure, on my way after my current client").await?;
    let offer = client.send_offer(&request.id, 4000).await?;

    backend.sign_in(customer);
    stores.app.set_user_mode(UserMode::Customer)?;
    client.respond_to_offer(&offer.id, true).await?;

    timeout(
        step * 10,
        chat_updates.wait_for(|s| {
            s.messages
                .iter()
                .any(|m| m.id == offer.id && m.offer_status == Some(OfferStatus::Accepted))
        }),
    )
    .await
    .map_err(|_| anyhow!("offer acceptance was not observed in time"))??;

    println!("Transcript:");
    for message in chat.messages() {
        print_message(&message);
    }

    drop(chat);
    drop(watch);
    let _ = timeout(step, printer).await;
    info!("Demo finished");
    Ok(())
}
