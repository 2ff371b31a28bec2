//! Human-readable generated labels: usernames and room tokens.

use uuid::Uuid;

const ADJECTIVES: [&str; 16] = [
    "Amber", "Brisk", "Calm", "Dusty", "Eager", "Fuzzy", "Gentle", "Hasty", "Icy", "Jolly",
    "Keen", "Lucky", "Mellow", "Nimble", "Quiet", "Rusty",
];

const ANIMALS: [&str; 16] = [
    "Fox", "Otter", "Heron", "Lynx", "Badger", "Marten", "Panda", "Raven", "Seal", "Tapir",
    "Wombat", "Yak", "Gecko", "Ibis", "Koala", "Moose",
];

/// A name like `Keen-Otter-42`.
pub fn generate_username() -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let adjective = ADJECTIVES[bytes[0] as usize % ADJECTIVES.len()];
    let animal = ANIMALS[bytes[1] as usize % ANIMALS.len()];
    let number = u16::from_le_bytes([bytes[2], bytes[3]]) % 100;
    format!("{adjective}-{animal}-{number}")
}

/// A short random room token of 10 lowercase hex digits.
pub fn generate_room_id() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}
