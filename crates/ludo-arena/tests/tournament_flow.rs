//! End-to-end bracket lifecycle against the in-process harness.

use std::time::Duration;

use ludo_arena::protocol::ServerEvent;
use ludo_arena::store::{keys, DocumentStoreExt};
use ludo_arena::testing::{wait_for_event, TestArena};
use ludo_arena::tournament::{Tournament, TournamentStatus};
use ludo_arena::types::UserId;

fn users(n: usize) -> Vec<UserId> {
    (0..n).map(|i| UserId::new(format!("user-{i}"))).collect()
}

async fn load_tournament(arena: &TestArena, id: &ludo_arena::types::TournamentId) -> Tournament {
    arena
        .services
        .store
        .get_json::<Tournament>(&keys::tournament(id))
        .await
        .unwrap()
        .expect("tournament exists")
        .0
}

#[tokio::test(start_paused = true)]
async fn reaching_the_player_limit_starts_round_one() {
    let arena = TestArena::new();
    let players = users(4);
    let mut feeds = Vec::new();
    for user in &players {
        feeds.push(arena.connect_user(user));
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Friday Cup", &players[0], 4, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    assert_eq!(tournament.status, TournamentStatus::Joining);
    assert!(tournament.joining_open);

    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    let after = load_tournament(&arena, &id).await;
    assert_eq!(after.status, TournamentStatus::InProgress);
    assert!(!after.joining_open);
    assert_eq!(after.current_round, 1);
    assert_eq!(after.rooms.len(), 1);
    assert_eq!(after.rooms[0].players.len(), 4);
    assert!(after.rooms[0].winner.is_none());

    // Every player is told their bracket room and sees the game start.
    for (user, feed) in players.iter().zip(feeds.iter_mut()) {
        let assigned = wait_for_event(feed, 20, |e| {
            matches!(e, ServerEvent::RoomAssigned { .. })
        })
        .await;
        let ServerEvent::RoomAssigned { room_id, .. } = assigned else {
            unreachable!()
        };
        assert_eq!(room_id, after.rooms[0].room_id);
        wait_for_event(feed, 20, |e| matches!(e, ServerEvent::GameStarted { .. })).await;

        let (linked, _) = arena
            .services
            .store
            .get_json::<ludo_arena::types::RoomId>(&keys::user_room(user))
            .await
            .unwrap()
            .expect("seat link exists");
        assert_eq!(linked, after.rooms[0].room_id);
    }

    // The pre-emptive start cancelled the joining timer.
    assert!(!arena.services.tasks.is_pending(&format!("close-joining:{id}")));
    assert!(arena.services.tasks.is_pending(&format!("match-monitor:{id}")));
}

#[tokio::test(start_paused = true)]
async fn joining_grace_expiry_starts_the_bracket() {
    let arena = TestArena::new();
    let players = users(3);
    for user in &players {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Slow Cup", &players[0], 10, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    let before = load_tournament(&arena, &id).await;
    assert_eq!(before.status, TournamentStatus::Joining);

    tokio::time::sleep(arena.services.config.joining_grace + Duration::from_secs(1)).await;

    let after = load_tournament(&arena, &id).await;
    assert_eq!(after.status, TournamentStatus::InProgress);
    assert_eq!(after.current_round, 1);
    assert_eq!(after.rooms.len(), 1);
    assert_eq!(after.rooms[0].players.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn five_survivors_split_into_balanced_rooms() {
    let arena = TestArena::new();
    let players = users(5);
    for user in &players {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Big Cup", &players[0], 5, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    let round_one = load_tournament(&arena, &id).await;
    assert_eq!(round_one.current_round, 1);
    assert_eq!(round_one.rooms.len(), 2);
    let mut sizes: Vec<usize> = round_one.rooms.iter().map(|r| r.players.len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![2, 3]);
}

#[tokio::test(start_paused = true)]
async fn monitor_advances_rounds_and_crowns_a_champion() {
    let arena = TestArena::new();
    let players = users(5);
    let mut feed = arena.connect_user(&players[0]);
    for user in &players[1..] {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Title Cup", &players[0], 5, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    // Round in progress: monitor ticks leave the bracket alone.
    tokio::time::sleep(Duration::from_secs(12)).await;
    let unchanged = load_tournament(&arena, &id).await;
    assert_eq!(unchanged.current_round, 1);

    // Both rooms report; the next tick builds round 2.
    let round_one = load_tournament(&arena, &id).await;
    for summary in &round_one.rooms {
        arena
            .services
            .tournaments
            .record_room_winner(&id, &summary.room_id, &summary.players[0])
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_secs(6)).await;

    let round_two = load_tournament(&arena, &id).await;
    assert_eq!(round_two.current_round, 2);
    assert_eq!(round_two.rooms.len(), 1);
    assert_eq!(round_two.rooms[0].players.len(), 2);
    assert!(round_two.rooms[0].winner.is_none());

    // The final reports; the tournament completes and announces it.
    let champion = round_two.rooms[0].players[0].clone();
    arena
        .services
        .tournaments
        .record_room_winner(&id, &round_two.rooms[0].room_id, &champion)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    let done = load_tournament(&arena, &id).await;
    assert_eq!(done.status, TournamentStatus::Completed);
    assert_eq!(done.winner, Some(champion.clone()));
    assert!(!arena.services.tasks.is_pending(&format!("match-monitor:{id}")));

    let over = wait_for_event(&mut feed, 60, |e| {
        matches!(e, ServerEvent::TournamentOver { .. })
    })
    .await;
    let ServerEvent::TournamentOver { winner, .. } = over else {
        unreachable!()
    };
    assert_eq!(winner, Some(champion));
}

#[tokio::test(start_paused = true)]
async fn close_joining_is_idempotent() {
    let arena = TestArena::new();
    let players = users(2);
    for user in &players {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Twice Cup", &players[0], 10, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    arena
        .services
        .tournaments
        .close_joining_and_start(&id)
        .await
        .unwrap();
    let first = load_tournament(&arena, &id).await;

    arena
        .services
        .tournaments
        .close_joining_and_start(&id)
        .await
        .unwrap();
    let second = load_tournament(&arena, &id).await;

    assert_eq!(first.current_round, second.current_round);
    assert_eq!(
        first
            .rooms
            .iter()
            .map(|r| r.room_id.clone())
            .collect::<Vec<_>>(),
        second
            .rooms
            .iter()
            .map(|r| r.room_id.clone())
            .collect::<Vec<_>>()
    );
}

#[tokio::test(start_paused = true)]
async fn joining_after_close_is_rejected() {
    let arena = TestArena::new();
    let players = users(2);
    for user in &players {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Late Cup", &players[0], 2, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    let latecomer = UserId::new("latecomer");
    arena.connect_user(&latecomer);
    let err = arena
        .services
        .tournaments
        .join_tournament(&id, &latecomer)
        .await
        .unwrap_err();
    assert!(matches!(err, ludo_arena::error::ArenaError::JoiningClosed));
}

#[tokio::test(start_paused = true)]
async fn duplicate_join_is_rejected() {
    let arena = TestArena::new();
    let user = UserId::new("user-0");
    arena.connect_user(&user);

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Dup Cup", &user, 10, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();

    arena
        .services
        .tournaments
        .join_tournament(&id, &user)
        .await
        .unwrap();
    let err = arena
        .services
        .tournaments
        .join_tournament(&id, &user)
        .await
        .unwrap_err();
    assert!(matches!(err, ludo_arena::error::ArenaError::AlreadyJoined));
}

#[tokio::test(start_paused = true)]
async fn capacity_two_odd_roster_starts_with_an_oversized_room() {
    let arena = TestArena::new();
    let players = users(3);
    for user in &players {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Pairs Cup", &players[0], 3, 2)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    // The straggler folds into the previous pair; the room stretches to
    // hold all three.
    let after = load_tournament(&arena, &id).await;
    assert_eq!(after.status, TournamentStatus::InProgress);
    assert_eq!(after.current_round, 1);
    assert_eq!(after.rooms.len(), 1);
    assert_eq!(after.rooms[0].players.len(), 3);

    let (room, _) = arena
        .services
        .store
        .get_json::<ludo_arena::room::Room>(&keys::room(&after.rooms[0].room_id))
        .await
        .unwrap()
        .expect("round room exists");
    assert!(room.game_started);
    assert_eq!(room.players.len(), 3);
    assert_eq!(room.max_players, 3);
}

#[tokio::test(start_paused = true)]
async fn redelivered_close_rebuilds_missing_round_rooms() {
    let arena = TestArena::new();
    let players = users(2);
    for user in &players {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Crash Cup", &players[0], 2, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    // Simulate a crash between committing the bracket and building the
    // room document.
    let started = load_tournament(&arena, &id).await;
    let room_id = started.rooms[0].room_id.clone();
    arena.services.store.delete(&keys::room(&room_id)).await.unwrap();

    arena
        .services
        .tournaments
        .close_joining_and_start(&id)
        .await
        .unwrap();

    let (room, _) = arena
        .services
        .store
        .get_json::<ludo_arena::room::Room>(&keys::room(&room_id))
        .await
        .unwrap()
        .expect("round room rebuilt under the same id");
    assert!(room.game_started);
    assert_eq!(room.players.len(), 2);

    let resumed = load_tournament(&arena, &id).await;
    assert_eq!(resumed.rooms[0].room_id, room_id);
    assert_eq!(resumed.current_round, 1);
}

#[tokio::test(start_paused = true)]
async fn monitor_rebuilds_missing_round_rooms() {
    let arena = TestArena::new();
    let players = users(2);
    for user in &players {
        arena.connect_user(user);
    }

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Heal Cup", &players[0], 2, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    for user in &players {
        arena
            .services
            .tournaments
            .join_tournament(&id, user)
            .await
            .unwrap();
    }

    let started = load_tournament(&arena, &id).await;
    let room_id = started.rooms[0].room_id.clone();
    arena.services.store.delete(&keys::room(&room_id)).await.unwrap();

    // The next monitor tick notices and rebuilds the lost room.
    tokio::time::sleep(arena.services.config.monitor_interval + Duration::from_secs(1)).await;

    let (room, _) = arena
        .services
        .store
        .get_json::<ludo_arena::room::Room>(&keys::room(&room_id))
        .await
        .unwrap()
        .expect("monitor rebuilt the round room");
    assert!(room.game_started);
}

#[tokio::test(start_paused = true)]
async fn understaffed_tournament_is_cancelled_at_close() {
    let arena = TestArena::new();
    let solo = UserId::new("solo");
    arena.connect_user(&solo);

    let tournament = arena
        .services
        .tournaments
        .open_tournament("Ghost Cup", &solo, 10, 4)
        .await
        .unwrap();
    let id = tournament.tournament_id.clone();
    arena
        .services
        .tournaments
        .join_tournament(&id, &solo)
        .await
        .unwrap();

    tokio::time::sleep(arena.services.config.joining_grace + Duration::from_secs(1)).await;

    let after = load_tournament(&arena, &id).await;
    assert_eq!(after.status, TournamentStatus::Cancelled);
    assert!(!after.joining_open);
}
