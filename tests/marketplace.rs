use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use khadamati::backend::types::{AVATARS_BUCKET, MESSAGES, PROFILES, REVIEWS};
use khadamati::backend::{Backend, MemoryBackend};
use khadamati::models::{Profile, RequestStatus, Role, ServiceRequest};
use khadamati::note::{NoteFields, NoteFilter};
use khadamati::services::admin::platform_stats;
use khadamati::services::{
    ChatService, CommunityService, ListingFilter, ListingService, ProfileForm, ProfileService, RatingService,
    SearchDebouncer,
};
use khadamati::{Error, LocalStore};

fn profile(id: &str, name: &str, role: Role, rating: f64, reviews: u32) -> Profile {
    Profile {
        id: id.to_string(),
        full_name: name.to_string(),
        username: Some(id.to_string()),
        phone: None,
        avatar_url: None,
        city: None,
        country: None,
        role,
        rating,
        reviews_count: reviews,
        is_verified: false,
        created_at: Utc::now(),
        last_seen_at: None,
    }
}

fn fields(service: &str, province: &str, area: &str) -> NoteFields {
    NoteFields {
        service: service.to_string(),
        province: province.to_string(),
        area: area.to_string(),
        phone: "0791234567".to_string(),
        bio: "خبرة عشر سنوات".to_string(),
    }
}

fn setup() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_profile(profile("alice", "Alice Nasser", Role::Client, 0.0, 0));
    backend.seed_profile(profile("omar", "Omar Haddad", Role::Technician, 4.0, 2));
    backend.seed_profile(profile("lina", "Lina Saleh", Role::Technician, 4.9, 10));
    backend
}

#[tokio::test]
async fn test_optimistic_send_leaves_one_confirmed_message() {
    let backend = setup();
    let chats = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let conv = chats.contact_user("omar").await.unwrap();
    let mut room = chats.open(&conv.id).await.unwrap();

    let sent = room.send("السلام عليكم").await.unwrap().unwrap();

    assert_eq!(room.messages().len(), 1);
    assert_eq!(room.messages()[0].id, sent.id);
    assert!(!room.messages()[0].is_temporary());
    assert_eq!(backend.list_messages(&conv.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_send_rolls_back() {
    let backend = setup();
    let chats = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let conv = chats.contact_user("omar").await.unwrap();
    let mut room = chats.open(&conv.id).await.unwrap();

    backend.deny_writes(MESSAGES);
    let err = room.send("hello").await.unwrap_err();

    assert!(err.is_permission_denied());
    assert!(room.messages().is_empty());

    backend.allow_writes(MESSAGES);
    room.send("hello again").await.unwrap();
    assert_eq!(room.messages().len(), 1);
}

#[tokio::test]
async fn test_realtime_echo_of_own_message_is_ignored() {
    let backend = setup();
    let chats = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let conv = chats.contact_user("omar").await.unwrap();
    let mut room = chats.open(&conv.id).await.unwrap();
    let mut events = room.watch().await.unwrap();

    room.send("hi").await.unwrap();
    let event = events.recv().await.unwrap();

    assert!(!room.apply(&event));
    assert_eq!(room.messages().len(), 1);
}

#[tokio::test]
async fn test_other_participant_message_arrives_through_watch() {
    let backend = setup();
    let alice = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let omar = ChatService::new(backend.clone(), LocalStore::in_memory(), "omar");
    let conv = alice.contact_user("omar").await.unwrap();

    let mut alice_room = alice.open(&conv.id).await.unwrap();
    let mut events = alice_room.watch().await.unwrap();
    let mut omar_room = omar.open(&conv.id).await.unwrap();
    omar_room.send("أهلاً").await.unwrap();

    let event = events.recv().await.unwrap();
    assert!(alice_room.apply(&event));
    assert_eq!(alice_room.messages()[0].sender_id, "omar");
}

#[tokio::test]
async fn test_contacting_a_listing_reuses_the_conversation() {
    let backend = setup();
    let omar_listings = ListingService::new(backend.clone(), Some("omar".to_string()));
    let request = omar_listings
        .publish(&fields("أعمال سباكة", "عمان", "خلدا"))
        .await
        .unwrap();

    let chats = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let first = chats.contact_listing(&request).await.unwrap();
    let second = chats.contact_listing(&request).await.unwrap();
    assert_eq!(first.id, second.id);

    let own = ChatService::new(backend.clone(), LocalStore::in_memory(), "omar");
    let err = own.contact_listing(&request).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_delete_conversation_removes_messages_first() {
    let backend = setup();
    let chats = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let conv = chats.contact_user("omar").await.unwrap();
    let mut room = chats.open(&conv.id).await.unwrap();
    room.send("one").await.unwrap();
    room.send("two").await.unwrap();

    chats.delete_conversation(&conv.id).await.unwrap();

    assert!(backend.list_messages(&conv.id).await.unwrap().is_empty());
    assert!(matches!(chats.open(&conv.id).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_unread_tracking() {
    let backend = setup();
    let alice = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let omar = ChatService::new(backend.clone(), LocalStore::in_memory(), "omar");
    let conv = alice.contact_user("omar").await.unwrap();

    // never opened by omar
    assert_eq!(omar.unread_count().await.unwrap(), 1);

    omar.open(&conv.id).await.unwrap();
    assert_eq!(omar.unread_count().await.unwrap(), 0);

    let earlier = Utc::now() - ChronoDuration::minutes(5);
    omar.tracker().mark_read_at(&conv.id, earlier).unwrap();
    let summaries = omar.conversations().await.unwrap();
    assert!(summaries[0].unread);
}

#[tokio::test]
async fn test_browse_filters_and_sorts_by_owner_rating() {
    let backend = setup();
    for owner in ["omar", "lina"] {
        ListingService::new(backend.clone(), Some(owner.to_string()))
            .publish(&fields("أعمال سباكة", "عمان", "خلدا"))
            .await
            .unwrap();
    }
    ListingService::new(backend.clone(), Some("omar".to_string()))
        .publish(&fields("أعمال كهرباء", "إربد", "الحصن"))
        .await
        .unwrap();

    let browse = ListingService::new(backend.clone(), None);
    let filter = ListingFilter {
        details: NoteFilter {
            service: Some("أعمال سباكة".to_string()),
            ..Default::default()
        },
        search: None,
    };
    let listings = browse.browse(&filter).await.unwrap();

    let owners: Vec<&str> = listings.iter().map(|l| l.request.requester_id.as_str()).collect();
    assert_eq!(owners, vec!["lina", "omar"]);

    let all = browse.browse(&ListingFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_publish_requires_every_field() {
    let backend = setup();
    let listings = ListingService::new(backend.clone(), Some("omar".to_string()));
    let mut incomplete = fields("أعمال سباكة", "عمان", "خلدا");
    incomplete.phone.clear();

    let err = listings.publish(&incomplete).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(listings.mine().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recent_excludes_old_listings() {
    let backend = setup();
    backend.seed_request(ServiceRequest {
        id: "old".to_string(),
        requester_id: "omar".to_string(),
        note: Some(fields("أعمال دهان", "عمان", "خلدا").encode().unwrap()),
        latitude: 0.0,
        longitude: 0.0,
        status: RequestStatus::Open,
        created_at: Utc::now() - ChronoDuration::days(2),
        owner: None,
    });
    let listings = ListingService::new(backend.clone(), Some("lina".to_string()));
    listings.publish(&fields("أعمال سباكة", "عمان", "خلدا")).await.unwrap();

    let recent = listings.recent().await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].request.requester_id, "lina");
}

#[tokio::test]
async fn test_follow_recent_refetches_after_publish_and_delete() {
    let backend = setup();
    let viewer = ListingService::new(backend.clone(), Some("alice".to_string()));
    let mut updates = viewer.follow_recent().await.unwrap();

    let omar = ListingService::new(backend.clone(), Some("omar".to_string()));
    let created = omar.publish(&fields("أعمال سباكة", "عمان", "خلدا")).await.unwrap();
    let recent = updates.recv().await.unwrap().unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].request.id, created.id);

    omar.remove(&created.id).await.unwrap();
    let recent = updates.recv().await.unwrap().unwrap();
    assert!(recent.is_empty());
}

#[tokio::test]
async fn test_follow_conversations_marks_new_activity_unread() {
    let backend = setup();
    let alice = ChatService::new(backend.clone(), LocalStore::in_memory(), "alice");
    let omar = ChatService::new(backend.clone(), LocalStore::in_memory(), "omar");
    let conv = alice.contact_user("omar").await.unwrap();
    omar.open(&conv.id).await.unwrap();

    let mut updates = omar.follow_conversations().await.unwrap();
    alice.open(&conv.id).await.unwrap().send("مرحبا").await.unwrap();

    let summaries = updates.recv().await.unwrap().unwrap();
    assert!(summaries[0].unread);

    // reading locally then another change clears the flag on the next refresh
    omar.tracker().mark_read_at(&conv.id, Utc::now() + ChronoDuration::minutes(1)).unwrap();
    backend.touch_conversation(&conv.id, Utc::now()).await.unwrap();
    let summaries = updates.recv().await.unwrap().unwrap();
    assert!(!summaries[0].unread);
}

#[tokio::test]
async fn test_only_owner_can_remove_listing() {
    let backend = setup();
    let created = ListingService::new(backend.clone(), Some("omar".to_string()))
        .publish(&fields("أعمال سباكة", "عمان", "خلدا"))
        .await
        .unwrap();

    let other = ListingService::new(backend.clone(), Some("alice".to_string()));
    assert!(other.remove(&created.id).await.is_err());

    let owner = ListingService::new(backend.clone(), Some("omar".to_string()));
    owner.remove(&created.id).await.unwrap();
    assert!(matches!(owner.get(&created.id).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_rating_flow() {
    let backend = setup();
    let store = LocalStore::in_memory();
    let rating = RatingService::new(backend.clone(), store.clone(), "alice");

    let updated = rating.rate("omar", 5).await.unwrap();
    assert_eq!(updated.rating, 4.33);
    assert_eq!(updated.reviews_count, 3);
    assert_eq!(backend.review_count(), 1);

    let err = rating.rate("omar", 4).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    assert!(matches!(rating.rate("alice", 5).await, Err(Error::Validation(_))));
    assert!(matches!(rating.rate("lina", 6).await, Err(Error::Validation(_))));
}

#[tokio::test]
async fn test_rating_survives_missing_reviews_table() {
    let backend = setup();
    backend.drop_table(REVIEWS);
    let rating = RatingService::new(backend.clone(), LocalStore::in_memory(), "alice");

    let updated = rating.rate("lina", 1).await.unwrap();
    assert_eq!(updated.reviews_count, 11);
    assert!(rating.rated_locally("lina"));
}

#[tokio::test]
async fn test_remote_review_blocks_second_device() {
    let backend = setup();
    RatingService::new(backend.clone(), LocalStore::in_memory(), "alice")
        .rate("omar", 3)
        .await
        .unwrap();

    // fresh local store, as on another device
    let other_device = RatingService::new(backend.clone(), LocalStore::in_memory(), "alice");
    assert!(other_device.already_rated("omar").await);
}

#[tokio::test]
async fn test_profile_update_rejects_taken_username() {
    let backend = setup();
    let service = ProfileService::new(backend.clone(), "alice");

    let form = ProfileForm {
        full_name: "Alice N".to_string(),
        username: "@Omar".to_string(),
        phone: String::new(),
        city: "عمان".to_string(),
        role: Role::Client,
    };
    let err = service.update(&form).await.unwrap_err();
    assert_eq!(err.to_string(), Error::Conflict("This username is already taken".to_string()).to_string());

    let form = ProfileForm {
        username: "alice_n".to_string(),
        ..form
    };
    let saved = service.update(&form).await.unwrap();
    assert_eq!(saved.username.as_deref(), Some("alice_n"));
}

#[tokio::test]
async fn test_profile_update_rejects_taken_full_name() {
    let backend = setup();
    let service = ProfileService::new(backend.clone(), "alice");
    let form = ProfileForm {
        full_name: "Lina Saleh".to_string(),
        username: "alice".to_string(),
        ..Default::default()
    };
    assert!(matches!(service.update(&form).await, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn test_avatar_upload_sets_public_url() {
    let backend = setup();
    let service = ProfileService::new(backend.clone(), "alice");

    let url = service.upload_avatar("me.png", vec![1, 2, 3]).await.unwrap();

    let path = url
        .strip_prefix(&format!("memory://storage/{}/", AVATARS_BUCKET))
        .unwrap();
    assert!(path.starts_with("alice/"));
    assert!(path.ends_with(".png"));
    assert_eq!(backend.object(AVATARS_BUCKET, path), Some(vec![1, 2, 3]));
    assert_eq!(service.me().await.unwrap().avatar_url, Some(url));
}

#[tokio::test]
async fn test_profile_write_denied_maps_to_permission_error() {
    let backend = setup();
    backend.deny_writes(PROFILES);
    let rating = RatingService::new(backend.clone(), LocalStore::in_memory(), "alice");

    let err = rating.rate("omar", 4).await.unwrap_err();
    assert!(err.is_permission_denied());
    assert!(!rating.rated_locally("omar"));
}

#[tokio::test]
async fn test_community_search_and_top_providers() {
    let backend = setup();
    let community = CommunityService::new(backend.clone());

    let found = community.search("@Lin").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "lina");

    let everyone = community.search("  ").await.unwrap();
    assert_eq!(everyone[0].id, "lina");

    let top = community.top_providers().await.unwrap();
    assert!(top.iter().all(|p| p.role.is_provider()));
    assert_eq!(top.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_debouncer_only_runs_last_query() {
    let backend = setup();
    let (mut debouncer, mut outcomes) = SearchDebouncer::new(CommunityService::new(backend), Duration::from_millis(300));

    debouncer.input("o");
    debouncer.input("om");
    debouncer.input("omar");

    let outcome = outcomes.recv().await.unwrap();
    assert_eq!(outcome.query, "omar");
    assert_eq!(outcome.result.unwrap()[0].id, "omar");

    let more = tokio::time::timeout(Duration::from_secs(5), outcomes.recv()).await;
    assert!(more.is_err());
}

#[tokio::test]
async fn test_platform_stats() {
    let backend = setup();
    ListingService::new(backend.clone(), Some("omar".to_string()))
        .publish(&fields("أعمال سباكة", "عمان", "خلدا"))
        .await
        .unwrap();
    backend.seed_request(ServiceRequest {
        id: "done".to_string(),
        requester_id: "lina".to_string(),
        note: None,
        latitude: 0.0,
        longitude: 0.0,
        status: RequestStatus::Delivered,
        created_at: Utc::now(),
        owner: None,
    });

    let stats = platform_stats(backend.as_ref()).await.unwrap();
    assert_eq!(stats.users, 3);
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.delivered, 1);
}
