pub mod admin;
pub mod chat;
pub mod community;
pub mod listings;
pub mod profile;
pub mod rating;
pub mod read_tracker;

pub use chat::{ChatRoom, ChatService, ConversationSummary};
pub use community::{CommunityService, SearchDebouncer};
pub use listings::{Listing, ListingFilter, ListingService};
pub use profile::{ProfileForm, ProfileService};
pub use rating::RatingService;
pub use read_tracker::ReadTracker;
