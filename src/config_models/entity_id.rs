//! Entity-id layout shared by every process of a cluster.
//!
//! Ids are plain integers so they can travel on the comm bus unchanged. Each
//! client process `c` owns the id block `[c * CLIENT_ID_STRIDE, (c + 1) *
//! CLIENT_ID_STRIDE)`; the name node lives at id 0 of client 0's block.

pub type EntityId = i32;

pub const CLIENT_ID_STRIDE: i32 = 1000;
pub const MAX_COMM_CHANNELS_PER_CLIENT: i32 = 99;

const NAME_NODE_OFFSET: i32 = 0;
const SERVER_OFFSET: i32 = 1;
const BG_OFFSET: i32 = 100;
const APP_THREAD_OFFSET: i32 = 200;

pub fn name_node_id() -> EntityId {
    NAME_NODE_OFFSET
}

pub fn server_thread_id(client_id: i32, channel_idx: i32) -> EntityId {
    client_id * CLIENT_ID_STRIDE + SERVER_OFFSET + channel_idx
}

pub fn bg_thread_id(client_id: i32, channel_idx: i32) -> EntityId {
    client_id * CLIENT_ID_STRIDE + BG_OFFSET + channel_idx
}

/// The bg worker of channel 0 coordinates table creation for its process.
pub fn head_bg_id(client_id: i32) -> EntityId {
    bg_thread_id(client_id, 0)
}

pub fn app_thread_id(client_id: i32, thread_idx: i32) -> EntityId {
    client_id * CLIENT_ID_STRIDE + APP_THREAD_OFFSET + thread_idx
}

pub fn client_id_of(entity: EntityId) -> i32 {
    entity / CLIENT_ID_STRIDE
}

pub fn is_bg_thread(entity: EntityId) -> bool {
    let local = entity % CLIENT_ID_STRIDE;
    (BG_OFFSET..BG_OFFSET + MAX_COMM_CHANNELS_PER_CLIENT).contains(&local)
}

pub fn is_server_thread(entity: EntityId) -> bool {
    let local = entity % CLIENT_ID_STRIDE;
    (SERVER_OFFSET..SERVER_OFFSET + MAX_COMM_CHANNELS_PER_CLIENT).contains(&local)
}

pub fn channel_of(entity: EntityId) -> i32 {
    let local = entity % CLIENT_ID_STRIDE;
    if is_bg_thread(entity) {
        local - BG_OFFSET
    } else {
        local - SERVER_OFFSET
    }
}

/// Communication channel responsible for `row_id` on every client.
pub fn channel_for_row(row_id: i32, num_channels: i32) -> i32 {
    row_id.rem_euclid(num_channels)
}

/// Server thread owning `row_id`. Rows of one channel are spread over the
/// server threads of that channel across all clients.
pub fn server_for_row(row_id: i32, num_channels: i32, num_clients: i32) -> EntityId {
    let channel = channel_for_row(row_id, num_channels);
    let client = (row_id.div_euclid(num_channels)).rem_euclid(num_clients);
    server_thread_id(client, channel)
}

pub fn all_server_ids(num_clients: i32, num_channels: i32) -> Vec<EntityId> {
    (0..num_clients)
        .flat_map(|c| (0..num_channels).map(move |ch| server_thread_id(c, ch)))
        .collect()
}

/// Server threads a given bg worker talks to: one per client, same channel.
pub fn server_ids_for_channel(channel_idx: i32, num_clients: i32) -> Vec<EntityId> {
    (0..num_clients)
        .map(|c| server_thread_id(c, channel_idx))
        .collect()
}

pub fn bg_ids_for_channel(channel_idx: i32, num_clients: i32) -> Vec<EntityId> {
    (0..num_clients)
        .map(|c| bg_thread_id(c, channel_idx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_do_not_collide_and_round_trip() {
        for client in 0..4 {
            for channel in 0..MAX_COMM_CHANNELS_PER_CLIENT {
                let server = server_thread_id(client, channel);
                let bg = bg_thread_id(client, channel);
                assert_ne!(server, bg);
                assert_ne!(name_node_id(), server);
                assert!(is_server_thread(server));
                assert!(is_bg_thread(bg));
                assert!(!is_bg_thread(server));
                assert_eq!(client, client_id_of(server));
                assert_eq!(client, client_id_of(bg));
                assert_eq!(channel, channel_of(server));
                assert_eq!(channel, channel_of(bg));
            }
        }
    }

    #[test]
    fn rows_spread_over_clients_within_channel() {
        let num_channels = 2;
        let num_clients = 3;
        for row in 0..60 {
            let server = server_for_row(row, num_channels, num_clients);
            assert_eq!(channel_for_row(row, num_channels), channel_of(server));
        }
        assert_eq!(server_thread_id(0, 0), server_for_row(0, 2, 3));
        assert_eq!(server_thread_id(1, 0), server_for_row(2, 2, 3));
        assert_eq!(server_thread_id(2, 1), server_for_row(5, 2, 3));
        assert_eq!(server_thread_id(0, 1), server_for_row(7, 2, 3));
    }
}
