use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use khadamati::backend::Backend;
use khadamati::catalog;
use khadamati::models::{Message, Profile, Role};
use khadamati::note::{ContactPreference, NoteFields, NoteFilter};
use khadamati::services::admin::platform_stats;
use khadamati::services::community::SearchOutcome;
use khadamati::services::{
    ChatService, CommunityService, ConversationSummary, Listing, ListingFilter, ListingService, ProfileForm,
    ProfileService, RatingService, SearchDebouncer,
};
use khadamati::{Config, LocalStore, RestBackend};

#[derive(Parser)]
#[command(name = "khadamati", version, about = "Home-services marketplace client")]
struct Cli {
    /// Signed-in user id (overrides KHADAMATI_USER_ID)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Directory for local state (overrides KHADAMATI_STATE_DIR)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Browse open listings
    Listings {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        province: Option<String>,
        #[arg(long)]
        area: Option<String>,
        #[arg(long)]
        search: Option<String>,
    },
    /// Your own open listings
    MyListings,
    /// Listings posted recently
    Recent {
        /// Keep running and reprint whenever listings change
        #[arg(long)]
        follow: bool,
    },
    /// Publish a new listing
    Post {
        #[arg(long)]
        service: String,
        #[arg(long)]
        province: String,
        #[arg(long)]
        area: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        bio: String,
    },
    DeleteListing { id: String },
    /// Start or resume the chat about a listing
    Contact { listing_id: String },
    /// Start or resume a direct chat with a user
    MessageUser { profile_id: String },
    /// List conversations
    Chats {
        /// Keep running and reprint whenever a conversation or message changes
        #[arg(long)]
        follow: bool,
    },
    /// Number of unread conversations
    Unread,
    /// Show a conversation and mark it read
    Open { conversation_id: String },
    Send {
        conversation_id: String,
        text: Option<String>,
        /// Share a location instead of text, as "lat,lon"
        #[arg(long)]
        location: Option<String>,
    },
    DeleteMessage { conversation_id: String, message_id: String },
    DeleteChat { conversation_id: String },
    /// Follow a conversation live
    Watch { conversation_id: String },
    Rate { profile_id: String, stars: u8 },
    Profile { id: Option<String> },
    EditProfile {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        username: String,
        #[arg(long, default_value = "")]
        phone: String,
        #[arg(long, default_value = "")]
        city: String,
        #[arg(long, default_value = "client")]
        role: Role,
    },
    /// Upload a new avatar image
    Avatar { file: PathBuf },
    /// Search the community; without a query, reads queries from stdin as you type
    Search { query: Option<String> },
    /// Top-rated technicians
    Top,
    /// Platform totals
    Stats,
    /// Service categories and regions
    Catalog,
}

struct App {
    config: Config,
    backend: Arc<dyn Backend>,
    store: LocalStore,
    user: Option<String>,
}

impl App {
    fn user(&self) -> Result<String> {
        self.user
            .clone()
            .context("No signed-in user; set KHADAMATI_USER_ID or pass --user")
    }

    fn listings(&self) -> ListingService {
        ListingService::new(self.backend.clone(), self.user.clone()).with_recent_window(self.config.recent_hours)
    }

    fn chats(&self) -> Result<ChatService> {
        Ok(ChatService::new(self.backend.clone(), self.store.clone(), self.user()?))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(user) = cli.user.clone() {
        config.user_id = Some(user);
    }
    if let Some(dir) = cli.state_dir.clone() {
        config.state_dir = dir;
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let backend: Arc<dyn Backend> = Arc::new(RestBackend::new(&config).context("Failed to create HTTP client")?);
    let app = App {
        store: LocalStore::open(&config.state_dir),
        user: config.user_id.clone(),
        backend,
        config,
    };

    run(&app, cli.command).await
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Listings {
            service,
            province,
            area,
            search,
        } => {
            let filter = ListingFilter {
                details: NoteFilter { service, province, area },
                search,
            };
            let listings = app.listings().browse(&filter).await?;
            print_listings(&listings);
        }
        Command::MyListings => print_listings(&app.listings().mine().await?),
        Command::Recent { follow: false } => print_listings(&app.listings().recent().await?),
        Command::Recent { follow: true } => {
            let listings = app.listings();
            print_listings(&listings.recent().await?);
            let mut updates = listings.follow_recent().await?;
            info!("Following recent listings (Ctrl-C to stop)");
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(Ok(recent)) => print_listings(&recent),
                        Some(Err(err)) => warn!("Refresh failed: {}", err),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Post {
            service,
            province,
            area,
            phone,
            bio,
        } => {
            if !catalog::areas_for(&province).is_empty() && !catalog::areas_for(&province).contains(&area.as_str()) {
                warn!("Area '{}' is not a listed district of {}", area, province);
            }
            let fields = NoteFields {
                service,
                province,
                area,
                phone,
                bio,
            };
            let created = app.listings().publish(&fields).await?;
            println!("✅ Published listing {}", created.id);
        }
        Command::DeleteListing { id } => {
            app.listings().remove(&id).await?;
            println!("🗑  Deleted listing {}", id);
        }
        Command::Contact { listing_id } => {
            let listing = app.listings().get(&listing_id).await?;
            let conversation = app.chats()?.contact_listing(&listing.request).await?;
            println!("💬 Conversation {}", conversation.id);
        }
        Command::MessageUser { profile_id } => {
            let conversation = app.chats()?.contact_user(&profile_id).await?;
            println!("💬 Conversation {}", conversation.id);
        }
        Command::Chats { follow } => {
            let user = app.user()?;
            let chats = app.chats()?;
            print_chats(&chats.conversations().await?, &user);
            if follow {
                let mut updates = chats.follow_conversations().await?;
                info!("Following chats (Ctrl-C to stop)");
                loop {
                    tokio::select! {
                        update = updates.recv() => match update {
                            Some(Ok(summaries)) => {
                                println!();
                                print_chats(&summaries, &user);
                            }
                            Some(Err(err)) => warn!("Refresh failed: {}", err),
                            None => break,
                        },
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
            }
        }
        Command::Unread => println!("{}", app.chats()?.unread_count().await?),
        Command::Open { conversation_id } => {
            let user = app.user()?;
            let room = app.chats()?.open(&conversation_id).await?;
            if let Some(other) = room.other_profile() {
                println!("Chat with {}\n", other.display_name());
            }
            for message in room.messages() {
                print_message(message, &user);
            }
        }
        Command::Send {
            conversation_id,
            text,
            location,
        } => {
            let mut room = app.chats()?.open(&conversation_id).await?;
            let sent = match (location, text) {
                (Some(loc), _) => {
                    let (lat, lon) = parse_location(&loc)?;
                    room.share_location(lat, lon).await
                }
                (None, Some(text)) => room.send(&text).await,
                (None, None) => bail!("Nothing to send; pass a message or --location"),
            };
            match sent {
                Ok(Some(message)) => println!("✅ Sent {}", message.id),
                Ok(None) => println!("Nothing to send"),
                Err(err) if err.is_permission_denied() => bail!("Send failed: RLS Policy issue"),
                Err(err) => return Err(err.into()),
            }
        }
        Command::DeleteMessage {
            conversation_id,
            message_id,
        } => {
            let mut room = app.chats()?.open(&conversation_id).await?;
            room.delete_message(&message_id).await?;
            println!("🗑  Deleted message {}", message_id);
        }
        Command::DeleteChat { conversation_id } => {
            app.chats()?.delete_conversation(&conversation_id).await?;
            println!("🗑  Deleted conversation {}", conversation_id);
        }
        Command::Watch { conversation_id } => watch(app, &conversation_id).await?,
        Command::Rate { profile_id, stars } => {
            let rating = RatingService::new(app.backend.clone(), app.store.clone(), app.user()?);
            let profile = rating.rate(&profile_id, stars).await?;
            println!(
                "⭐ Thank you! {} is now rated {:.2} ({} reviews)",
                profile.display_name(),
                profile.rating,
                profile.reviews_count
            );
        }
        Command::Profile { id } => {
            let service = ProfileService::new(app.backend.clone(), app.user.clone().unwrap_or_default());
            let profile = match id {
                Some(id) => service.view(&id).await?,
                None => service.me().await?,
            };
            print_profile(&profile);
            if let Some(user) = &app.user {
                if user != &profile.id {
                    let rating = RatingService::new(app.backend.clone(), app.store.clone(), user.clone());
                    if rating.already_rated(&profile.id).await {
                        println!("   You already rated this profile");
                    }
                }
            }
        }
        Command::EditProfile {
            full_name,
            username,
            phone,
            city,
            role,
        } => {
            let service = ProfileService::new(app.backend.clone(), app.user()?);
            let form = ProfileForm {
                full_name,
                username,
                phone,
                city,
                role,
            };
            let saved = service.update(&form).await?;
            println!("✅ Profile saved");
            print_profile(&saved);
        }
        Command::Avatar { file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let name = file.file_name().and_then(|n| n.to_str()).unwrap_or("avatar.bin");
            let url = ProfileService::new(app.backend.clone(), app.user()?)
                .upload_avatar(name, bytes)
                .await?;
            println!("🖼  Avatar URL: {}", url);
        }
        Command::Search { query: Some(query) } => {
            let profiles = CommunityService::new(app.backend.clone()).search(&query).await?;
            println!("{} results", profiles.len());
            profiles.iter().for_each(print_profile);
        }
        Command::Search { query: None } => interactive_search(app).await?,
        Command::Top => {
            for profile in CommunityService::new(app.backend.clone()).top_providers().await? {
                print_profile(&profile);
            }
        }
        Command::Stats => {
            let stats = platform_stats(app.backend.as_ref()).await?;
            println!("Users:     {}", stats.users);
            println!("Listings:  {}", stats.requests);
            println!("Delivered: {}", stats.delivered);
        }
        Command::Catalog => {
            println!("Services:");
            for service in catalog::SERVICES {
                println!("  {}", service);
            }
            for province in catalog::provinces() {
                println!("{}: {}", province, catalog::areas_for(province).join("، "));
            }
        }
    }

    Ok(())
}

async fn watch(app: &App, conversation_id: &str) -> Result<()> {
    let user = app.user()?;
    let chats = app.chats()?;
    let mut room = chats.open(conversation_id).await?;
    for message in room.messages() {
        print_message(message, &user);
    }

    let mut events = room.watch().await?;
    info!("Watching conversation {} (Ctrl-C to stop)", conversation_id);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Realtime stream ended");
                    break;
                };
                if room.apply(&event) {
                    if let Some(message) = room.messages().last() {
                        print_message(message, &user);
                    }
                    if let Err(err) = chats.tracker().mark_read(conversation_id) {
                        warn!("Could not store read status: {}", err);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn interactive_search(app: &App) -> Result<()> {
    let community = CommunityService::new(app.backend.clone());
    let (mut debouncer, mut outcomes) = SearchDebouncer::new(community, app.config.search_debounce());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    debouncer.input("");
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => debouncer.input(&line),
                None => break,
            },
            Some(SearchOutcome { query, result }) = outcomes.recv() => match result {
                Ok(profiles) => {
                    println!("── {} results for '{}'", profiles.len(), query);
                    profiles.iter().for_each(print_profile);
                }
                Err(err) => warn!("Search error: {}", err),
            },
        }
    }
    Ok(())
}

fn parse_location(raw: &str) -> Result<(f64, f64)> {
    let (lat, lon) = raw.split_once(',').context("Location must be \"lat,lon\"")?;
    let lat = lat.trim().parse().context("Invalid latitude")?;
    let lon = lon.trim().parse().context("Invalid longitude")?;
    Ok((lat, lon))
}

fn print_listings(listings: &[Listing]) {
    info!("\n✅ {} listings\n", listings.len());
    for (i, listing) in listings.iter().enumerate() {
        let details = &listing.details;
        let owner = listing.request.owner.as_ref();
        println!("{}. {} ({})", i + 1, details.service, listing.request.id);
        println!(
            "   {} · {}   ⭐ {:.1}",
            details.province,
            details.area,
            listing.request.owner_rating()
        );
        if let Some(owner) = owner {
            println!("   By: {}", owner.display_name());
        }
        if !details.phone.is_empty() {
            let via = match listing.contact {
                ContactPreference::Call => "call",
                ContactPreference::WhatsApp => "WhatsApp",
            };
            println!("   Phone: {} (prefers {})", details.phone, via);
        }
        println!("   {}", details.bio);
        println!();
    }
}

fn print_chats(summaries: &[ConversationSummary], user_id: &str) {
    if summaries.is_empty() {
        println!("No active chats");
    }
    for summary in summaries {
        let conv = &summary.conversation;
        let name = conv.other_profile(user_id).map(Profile::display_name).unwrap_or("مستخدم");
        let marker = if summary.unread { "●" } else { " " };
        println!(
            "{} {}  {}  (last activity {})",
            marker,
            conv.id,
            name,
            conv.last_message_at.format("%Y-%m-%d %H:%M")
        );
    }
}

fn print_profile(profile: &Profile) {
    let handle = profile.username.as_deref().map(|u| format!(" @{}", u)).unwrap_or_default();
    let verified = if profile.is_verified { " ✔" } else { "" };
    println!(
        "{}{}{}  [{}]  ⭐ {:.1} ({} reviews)",
        profile.display_name(),
        handle,
        verified,
        profile.role.as_str(),
        profile.rating,
        profile.reviews_count
    );
    if let Some(city) = &profile.city {
        println!("   City: {}", city);
    }
    if let Some(phone) = &profile.phone {
        println!("   Phone: {}", phone);
    }
}

fn print_message(message: &Message, user_id: &str) {
    let who = if message.sender_id == user_id { "me" } else { "them" };
    let body = if message.is_location() {
        format!("📍 Location Share: {}", message.text.as_deref().unwrap_or(""))
    } else {
        message.text.clone().unwrap_or_default()
    };
    println!("[{}] {:>4}: {}", message.created_at.format("%H:%M"), who, body);
}
