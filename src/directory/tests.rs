//! Directory Module Tests
//!
//! ## Test Scopes
//! - **Routing**: least-load selection, tie-breaks, dead and unknown nodes filtered.
//! - **Catalogs**: full replace on re-registration, isolation between nodes, purge.
//! - **Handshake**: nothing is applied before `DONE_FILES`; slow or oversized handshakes are dropped.
//! - **Endpoints**: the index over real sockets, alone and against a live monitor.

#[cfg(test)]
mod tests {
    use crate::config::{IndexConfig, MonitorConfig};
    use crate::directory::catalog::Directory;
    use crate::directory::http::{handle_health, handle_resolve, handle_servers};
    use crate::directory::protocol::{
        IndexRequest, OK_DEREGISTERED, OK_FILES_ADDED, OK_REGISTERED, WELCOME, parse_file_row,
        parse_routing,
    };
    use crate::directory::server::{HandshakeLimits, IndexState, Reply, Session};
    use crate::directory::service::IndexService;
    use crate::directory::source::{MembershipSource, RemoteMembership};
    use crate::error::CdnError;
    use crate::membership::protocol::ServerRow;
    use crate::membership::service::MembershipService;
    use crate::membership::snapshot::MembershipSnapshot;
    use crate::membership::store::MembershipStore;
    use crate::membership::types::{Heartbeat, NodeAddress, NodeId, NodeState};
    use crate::transport::{LineConn, request_rows};
    use axum::extract::{Extension, Path};
    use axum::http::StatusCode;
    use axum::Json;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    const TIMEOUT: Duration = Duration::from_secs(8);

    fn heartbeat(id: &str, load: u64) -> Heartbeat {
        Heartbeat {
            id: NodeId::from(id),
            address: NodeAddress::new("127.0.0.1", 7001),
            load,
            file_count: 1,
            sent_at: None,
        }
    }

    fn files(rows: &[(&str, u64)]) -> Vec<(String, u64)> {
        rows.iter()
            .map(|(name, size)| (name.to_string(), *size))
            .collect()
    }

    fn register(directory: &Directory, id: &str, port: u16, rows: &[(&str, u64)]) {
        directory.register_node(
            NodeId::from(id),
            NodeAddress::new("10.0.0.1", port),
            files(rows),
        );
    }

    fn peer() -> SocketAddr {
        "10.0.0.5:40000".parse().unwrap()
    }

    // ============================================================
    // ROUTING TESTS
    // ============================================================

    #[test]
    fn test_resolve_picks_least_loaded_alive_host() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.ingest_heartbeat_at(heartbeat("A", 5), t0);
        store.ingest_heartbeat_at(heartbeat("B", 1), t0);

        let directory = Directory::new();
        register(&directory, "A", 7001, &[("x", 10)]);
        register(&directory, "B", 7002, &[("x", 10)]);

        let decision = directory.resolve("x", &store.snapshot_at(t0)).unwrap();
        assert_eq!(decision.node_id, NodeId::from("B"));
        assert_eq!(decision.address, NodeAddress::new("10.0.0.1", 7002));
        assert_eq!(decision.size, 10);
    }

    #[test]
    fn test_resolve_breaks_ties_by_lowest_id() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        for id in ["CS3", "CS1", "CS2"] {
            store.ingest_heartbeat_at(heartbeat(id, 2), t0);
        }

        let directory = Directory::new();
        register(&directory, "CS3", 7003, &[("x", 1)]);
        register(&directory, "CS2", 7002, &[("x", 1)]);
        register(&directory, "CS1", 7001, &[("x", 1)]);

        for _ in 0..10 {
            let decision = directory.resolve("x", &store.snapshot_at(t0)).unwrap();
            assert_eq!(decision.node_id, NodeId::from("CS1"));
        }
    }

    #[test]
    fn test_resolve_never_returns_dead_host() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.ingest_heartbeat_at(heartbeat("A", 0), t0);
        store.ingest_heartbeat_at(heartbeat("B", 9), t0 + Duration::from_secs(6));

        let directory = Directory::new();
        register(&directory, "A", 7001, &[("x", 10)]);
        register(&directory, "B", 7002, &[("x", 10)]);

        // A expired at t0 + 8s; no sweep has run yet.
        let snapshot = store.snapshot_at(t0 + Duration::from_secs(9));
        let decision = directory.resolve("x", &snapshot).unwrap();
        assert_eq!(decision.node_id, NodeId::from("B"));
    }

    #[test]
    fn test_resolve_distinguishes_not_found_from_unavailable() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.ingest_heartbeat_at(heartbeat("A", 0), t0);

        let directory = Directory::new();
        register(&directory, "A", 7001, &[("x", 10)]);

        let later = store.snapshot_at(t0 + Duration::from_secs(20));
        assert!(matches!(
            directory.resolve("x", &later),
            Err(CdnError::Unavailable(_))
        ));
        assert!(matches!(
            directory.resolve("missing", &later),
            Err(CdnError::NotFound(_))
        ));
    }

    #[test]
    fn test_unknown_node_is_filtered() {
        let directory = Directory::new();
        register(&directory, "ghost", 7001, &[("x", 10)]);

        let snapshot = MembershipSnapshot::empty();
        assert!(matches!(
            directory.resolve("x", &snapshot),
            Err(CdnError::Unavailable(_))
        ));
        assert!(directory.list_files(&snapshot).is_empty());

        let servers = directory.list_servers(&snapshot);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].state, NodeState::Dead);
        assert_eq!(servers[0].load, 0);
    }

    // ============================================================
    // CATALOG TESTS
    // ============================================================

    #[test]
    fn test_reregistration_replaces_whole_catalog() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.ingest_heartbeat_at(heartbeat("A", 0), t0);
        let snapshot = store.snapshot_at(t0);

        let directory = Directory::new();
        register(&directory, "A", 7001, &[("x", 1), ("y", 2)]);
        register(&directory, "A", 7001, &[("y", 3), ("z", 4)]);

        assert!(matches!(
            directory.resolve("x", &snapshot),
            Err(CdnError::NotFound(_))
        ));
        assert_eq!(directory.resolve("y", &snapshot).unwrap().size, 3);
        assert_eq!(directory.resolve("z", &snapshot).unwrap().size, 4);
        assert!(directory.file_entries("x").is_empty());
        assert_eq!(directory.file_name_count(), 2);
    }

    #[test]
    fn test_reregistration_leaves_other_nodes_alone() {
        let directory = Directory::new();
        register(&directory, "A", 7001, &[("shared", 1), ("only_a", 1)]);
        register(&directory, "B", 7002, &[("shared", 2)]);

        register(&directory, "A", 7001, &[]);

        let entries = directory.file_entries("shared");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_id, NodeId::from("B"));
        assert!(directory.file_entries("only_a").is_empty());
        assert_eq!(directory.node_count(), 2);
    }

    #[test]
    fn test_deregister_drops_all_rows() {
        let directory = Directory::new();
        register(&directory, "A", 7001, &[("x", 1), ("y", 1)]);

        let removed = directory.deregister_node(&NodeId::from("A")).unwrap();
        assert_eq!(removed.files.len(), 2);
        assert_eq!(directory.node_count(), 0);
        assert_eq!(directory.file_name_count(), 0);
        assert!(directory.deregister_node(&NodeId::from("A")).is_none());
    }

    #[test]
    fn test_listings_follow_membership() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.ingest_heartbeat_at(heartbeat("B", 4), t0);
        store.ingest_heartbeat_at(heartbeat("C", 1), t0);

        let directory = Directory::new();
        register(&directory, "A", 7001, &[("a.txt", 1)]);
        register(&directory, "B", 7002, &[("b.txt", 2), ("shared", 20)]);
        register(&directory, "C", 7003, &[("shared", 30)]);

        let snapshot = store.snapshot_at(t0);
        let listed = directory.list_files(&snapshot);
        let names: Vec<&str> = listed.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["b.txt", "shared"]);
        assert_eq!(listed[1].size, 20);

        let servers = directory.list_servers(&snapshot);
        let states: Vec<(&str, NodeState, u64)> = servers
            .iter()
            .map(|row| (row.id.as_str(), row.state, row.load))
            .collect();
        assert_eq!(
            states,
            vec![
                ("A", NodeState::Dead, 0),
                ("B", NodeState::Alive, 4),
                ("C", NodeState::Alive, 1),
            ]
        );
    }

    #[test]
    fn test_purge_only_removes_long_dead_nodes() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.ingest_heartbeat_at(heartbeat("old", 0), t0);
        store.ingest_heartbeat_at(heartbeat("fresh", 0), t0 + Duration::from_secs(60));

        let directory = Directory::new();
        register(&directory, "old", 7001, &[("x", 1)]);
        register(&directory, "fresh", 7002, &[("x", 1)]);

        // "old" has been dead since t0 + 8s.
        let snapshot = store.snapshot_at(t0 + Duration::from_secs(62));
        let purged = directory.purge_dead(&snapshot, Duration::from_secs(30));
        assert_eq!(purged, vec![NodeId::from("old")]);
        assert!(directory.catalog(&NodeId::from("fresh")).is_some());
    }

    #[test]
    fn test_first_registration_is_visible_all_at_once() {
        let store = MembershipStore::new(TIMEOUT);
        let t0 = Instant::now();
        store.ingest_heartbeat_at(heartbeat("A", 0), t0);
        let snapshot = store.snapshot_at(t0);

        let rows: Vec<(String, u64)> = (0..2000).map(|i| (format!("f{}", i), i)).collect();

        for _ in 0..50 {
            let directory = Arc::new(Directory::new());
            let writer = {
                let directory = directory.clone();
                let rows = rows.clone();
                std::thread::spawn(move || {
                    directory.register_node(
                        NodeId::from("A"),
                        NodeAddress::new("10.0.0.1", 7001),
                        rows,
                    )
                })
            };

            let catalog = loop {
                if let Some(catalog) = directory.catalog(&NodeId::from("A")) {
                    break catalog;
                }
                std::thread::yield_now();
            };
            assert_eq!(catalog.files.len(), 2000);

            let missing = rows
                .iter()
                .filter(|(name, _)| directory.resolve(name, &snapshot).is_err())
                .count();
            assert_eq!(missing, 0, "catalog visible before its names were linked");

            assert_eq!(writer.join().unwrap(), 2000);
        }
    }

    // ============================================================
    // END-TO-END SCENARIO (explicit clock)
    // ============================================================

    #[test]
    fn test_node_recovers_without_reregistration() {
        let store = MembershipStore::new(TIMEOUT);
        let directory = Directory::new();
        let t0 = Instant::now();
        let at = |secs: u64| t0 + Duration::from_secs(secs);

        directory.register_node(
            NodeId::from("CS1"),
            NodeAddress::new("localhost", 7001),
            files(&[("doc.txt", 600)]),
        );
        store.ingest_heartbeat_at(heartbeat("CS1", 0), t0);

        let decision = directory.resolve("doc.txt", &store.snapshot_at(t0)).unwrap();
        assert_eq!(decision.node_id, NodeId::from("CS1"));
        assert_eq!(decision.address, NodeAddress::new("localhost", 7001));
        assert_eq!(decision.size, 600);

        assert_eq!(store.sweep_at(at(9)).len(), 1);
        assert!(matches!(
            directory.resolve("doc.txt", &store.snapshot_at(at(9))),
            Err(CdnError::Unavailable(_))
        ));

        store.ingest_heartbeat_at(heartbeat("CS1", 0), at(10));

        let decision = directory
            .resolve("doc.txt", &store.snapshot_at(at(11)))
            .unwrap();
        assert_eq!(decision.node_id, NodeId::from("CS1"));
        assert_eq!(decision.size, 600);
    }

    // ============================================================
    // HANDSHAKE TESTS
    // ============================================================

    fn local_state(store: Arc<MembershipStore>) -> Arc<IndexState> {
        IndexState::new(
            Arc::new(Directory::new()),
            store,
            Duration::from_secs(1),
            HandshakeLimits::default(),
        )
    }

    #[test]
    fn test_handshake_applies_nothing_before_done_files() {
        let store = Arc::new(MembershipStore::new(TIMEOUT));
        store.ingest_heartbeat(heartbeat("CS1", 0));
        let state = local_state(store.clone());
        let mut session = Session::new(peer());

        assert_eq!(
            state.dispatch("REGISTER CS1 7001 7002", &mut session),
            Reply::Line(OK_REGISTERED.to_string())
        );
        assert_eq!(
            state.dispatch("ADD_FILE CS1 doc.txt 600", &mut session),
            Reply::None
        );
        assert_eq!(state.dispatch("ADD_FILE img.png 20", &mut session), Reply::None);
        assert_eq!(state.directory.node_count(), 0);
        assert!(session.has_pending_registration());

        assert_eq!(
            state.dispatch("DONE_FILES", &mut session),
            Reply::Line(OK_FILES_ADDED.to_string())
        );
        assert!(!session.has_pending_registration());

        let catalog = state.directory.catalog(&NodeId::from("CS1")).unwrap();
        assert_eq!(catalog.files.len(), 2);
        assert_eq!(catalog.address, NodeAddress::new("10.0.0.5", 7001));

        let Reply::Line(routing) = state.dispatch("GET doc.txt", &mut session) else {
            panic!("GET should answer with one line");
        };
        assert_eq!(routing, "SERVER 10.0.0.5 7001 CS1 600");

        assert_eq!(
            state.dispatch("DEREGISTER CS1", &mut session),
            Reply::Line(OK_DEREGISTERED.to_string())
        );
        assert_eq!(state.directory.node_count(), 0);
        assert!(store.get(&NodeId::from("CS1")).is_none());
    }

    #[test]
    fn test_handshake_rejects_rows_without_register() {
        let state = local_state(Arc::new(MembershipStore::new(TIMEOUT)));
        let mut session = Session::new(peer());

        assert_eq!(
            state.dispatch("ADD_FILE CS1 doc.txt 600", &mut session),
            Reply::Line("ERROR NOT_REGISTERED".to_string())
        );
        assert_eq!(
            state.dispatch("DONE_FILES", &mut session),
            Reply::Line("ERROR NOT_REGISTERED".to_string())
        );

        state.dispatch("REGISTER CS1 7001 7002", &mut session);
        assert_eq!(
            state.dispatch("ADD_FILE CS2 doc.txt 600", &mut session),
            Reply::Line("ERROR INVALID_FORMAT".to_string())
        );
    }

    #[test]
    fn test_handshake_past_deadline_is_dropped() {
        let state = local_state(Arc::new(MembershipStore::new(TIMEOUT)));
        let mut session = Session::new(peer());
        let t0 = Instant::now();
        let deadline = state.handshake.timeout;

        state.dispatch_at("REGISTER CS1 7001 7002", &mut session, t0);
        assert_eq!(
            state.dispatch_at("ADD_FILE a 1", &mut session, t0 + Duration::from_secs(1)),
            Reply::None
        );
        assert_eq!(
            state.dispatch_at("ADD_FILE b 1", &mut session, t0 + deadline),
            Reply::Close("ERROR TIMEOUT".to_string())
        );
        assert!(!session.has_pending_registration());
        assert_eq!(
            state.dispatch_at("DONE_FILES", &mut session, t0 + deadline),
            Reply::Line("ERROR NOT_REGISTERED".to_string())
        );
        assert_eq!(state.directory.node_count(), 0);
    }

    #[test]
    fn test_handshake_caps_buffered_rows() {
        let state = IndexState::new(
            Arc::new(Directory::new()),
            Arc::new(MembershipStore::new(TIMEOUT)),
            Duration::from_secs(1),
            HandshakeLimits {
                timeout: Duration::from_secs(30),
                max_files: 2,
            },
        );
        let mut session = Session::new(peer());

        state.dispatch("REGISTER CS1 7001 7002", &mut session);
        assert_eq!(state.dispatch("ADD_FILE a 1", &mut session), Reply::None);
        assert_eq!(state.dispatch("ADD_FILE b 1", &mut session), Reply::None);
        // Re-announcing a buffered name does not count against the cap.
        assert_eq!(state.dispatch("ADD_FILE a 2", &mut session), Reply::None);
        assert_eq!(
            state.dispatch("ADD_FILE c 1", &mut session),
            Reply::Close("ERROR INVALID_FORMAT".to_string())
        );
        assert!(!session.has_pending_registration());
        assert_eq!(state.directory.node_count(), 0);
    }

    #[test]
    fn test_malformed_lines_are_rejected() {
        let state = local_state(Arc::new(MembershipStore::new(TIMEOUT)));
        let mut session = Session::new(peer());

        for (line, expected) in [
            ("REGISTER CS1 notaport 7002", "ERROR INVALID_FORMAT"),
            ("REGISTER CS1", "ERROR INVALID_FORMAT"),
            ("GET", "ERROR INVALID_FORMAT"),
            ("ADD_FILE CS1 doc.txt -4", "ERROR INVALID_FORMAT"),
            ("FETCH doc.txt", "ERROR UNKNOWN_COMMAND"),
            ("get doc.txt", "ERROR UNKNOWN_COMMAND"),
        ] {
            assert_eq!(
                state.dispatch(line, &mut session),
                Reply::Line(expected.to_string()),
                "line {:?}",
                line
            );
        }

        assert_eq!(
            state.dispatch("HELLO", &mut session),
            Reply::Line(WELCOME.to_string())
        );
        assert_eq!(
            state.dispatch("GET nothing.bin", &mut session),
            Reply::Line("ERROR FILE_NOT_FOUND".to_string())
        );
    }

    #[test]
    fn test_update_load_changes_routing() {
        let store = Arc::new(MembershipStore::new(TIMEOUT));
        store.ingest_heartbeat(heartbeat("A", 0));
        store.ingest_heartbeat(heartbeat("B", 3));
        let state = local_state(store);
        register(&state.directory, "A", 7001, &[("x", 1)]);
        register(&state.directory, "B", 7002, &[("x", 1)]);
        let mut session = Session::new(peer());

        assert_eq!(
            state.dispatch("UPDATE_LOAD A 10", &mut session),
            Reply::Line("OK".to_string())
        );
        let Reply::Line(routing) = state.dispatch("GET x", &mut session) else {
            panic!("GET should answer with one line");
        };
        assert!(routing.contains(" B "), "got {}", routing);
    }

    #[test]
    fn test_server_down_parses_with_and_without_timestamp() {
        assert_eq!(
            IndexRequest::parse("SERVER_DOWN CS1 1700000000").unwrap(),
            IndexRequest::ServerDown {
                id: NodeId::from("CS1"),
                timestamp: 1_700_000_000,
            }
        );
        assert!(matches!(
            IndexRequest::parse("SERVER_DOWN CS1").unwrap(),
            IndexRequest::ServerDown { timestamp: 0, .. }
        ));
    }

    // ============================================================
    // HTTP STATUS SURFACE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_http_views_match_line_protocol() {
        let store = Arc::new(MembershipStore::new(TIMEOUT));
        store.ingest_heartbeat(heartbeat("CS1", 2));
        let state = local_state(store);
        register(&state.directory, "CS1", 7001, &[("doc.txt", 600)]);
        register(&state.directory, "CS2", 7002, &[("doc.txt", 600)]);

        let (status, Json(health)) = handle_health(Extension(state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!((health.nodes, health.alive_nodes, health.files), (2, 1, 1));

        let (_, Json(servers)) = handle_servers(Extension(state.clone())).await;
        let json = serde_json::to_value(&servers).unwrap();
        assert_eq!(json[0]["id"], "CS1");
        assert_eq!(json[0]["state"], "alive");
        assert_eq!(json[1]["state"], "dead");

        let (status, Json(resolved)) =
            handle_resolve(Extension(state.clone()), Path("doc.txt".to_string())).await;
        assert_eq!(status, StatusCode::OK);
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["decision"]["node_id"], "CS1");
        assert_eq!(json["decision"]["address"]["port"], 7001);

        let (status, Json(resolved)) =
            handle_resolve(Extension(state), Path("missing".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(resolved.error.as_deref(), Some("FILE_NOT_FOUND"));
    }

    // ============================================================
    // SOCKET TESTS
    // ============================================================

    #[tokio::test]
    async fn test_index_serves_registration_and_lookup_over_tcp() {
        let store = Arc::new(MembershipStore::new(TIMEOUT));
        store.ingest_heartbeat(heartbeat("CS1", 0));

        let index = IndexService::with_local_membership(IndexConfig::ephemeral(), store.clone())
            .start()
            .await
            .unwrap();
        let addr = index.client_addr.to_string();

        let mut conn = LineConn::connect(&addr, Duration::from_secs(2)).await.unwrap();
        conn.write_line("REGISTER CS1 7001 7002").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap().unwrap(), OK_REGISTERED);
        conn.write_line("ADD_FILE CS1 doc.txt 600").await.unwrap();
        conn.write_line("DONE_FILES").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap().unwrap(), OK_FILES_ADDED);

        conn.write_line("GET doc.txt").await.unwrap();
        let line = conn.read_line().await.unwrap().unwrap();
        let decision = parse_routing(&line, "doc.txt").unwrap();
        assert_eq!(decision.node_id, NodeId::from("CS1"));
        assert_eq!(decision.address, NodeAddress::new("127.0.0.1", 7001));
        conn.shutdown().await;

        let rows = request_rows(&addr, "LIST_FILES", Duration::from_secs(2))
            .await
            .unwrap();
        let listed = parse_file_row(&rows[0]).unwrap();
        assert_eq!((listed.name.as_str(), listed.size), ("doc.txt", 600));

        let rows = request_rows(&addr, "LIST_SERVERS", Duration::from_secs(2))
            .await
            .unwrap();
        let row = ServerRow::parse(&rows[0]).unwrap();
        assert_eq!(row.state, NodeState::Alive);

        index.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_mid_handshake_applies_nothing() {
        let store = Arc::new(MembershipStore::new(TIMEOUT));
        let index = IndexService::with_local_membership(IndexConfig::ephemeral(), store)
            .start()
            .await
            .unwrap();
        let addr = index.client_addr.to_string();

        let mut conn = LineConn::connect(&addr, Duration::from_secs(2)).await.unwrap();
        conn.write_line("REGISTER CS9 7009 7010").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap().unwrap(), OK_REGISTERED);
        conn.write_line("ADD_FILE CS9 half.bin 1").await.unwrap();
        conn.shutdown().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(index.state.directory.node_count(), 0);

        index.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_handshake_is_cut_off() {
        let store = Arc::new(MembershipStore::new(TIMEOUT));
        let index = IndexService::with_local_membership(
            IndexConfig {
                io_timeout: Duration::from_millis(200),
                handshake_timeout: Duration::from_millis(500),
                ..IndexConfig::ephemeral()
            },
            store,
        )
        .start()
        .await
        .unwrap();
        let addr = index.client_addr.to_string();

        let mut conn = LineConn::connect(&addr, Duration::from_secs(2)).await.unwrap();
        conn.write_line("REGISTER CS9 7009 7010").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap().unwrap(), OK_REGISTERED);

        // Each row arrives within the I/O timeout; the handshake as a whole does not.
        let mut reply = None;
        for i in 0..30 {
            conn.write_line(&format!("ADD_FILE CS9 drip{}.bin 1", i))
                .await
                .unwrap();
            if let Ok(line) = conn.read_line_within(Duration::from_millis(150)).await {
                reply = line;
                break;
            }
        }
        assert_eq!(reply.as_deref(), Some("ERROR TIMEOUT"));
        assert_eq!(index.state.directory.node_count(), 0);

        index.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_membership_mirrors_monitor() {
        let monitor = MembershipService::new(MonitorConfig::ephemeral())
            .start()
            .await
            .unwrap();
        monitor.service.handle_datagram(
            b"HEARTBEAT CS1 localhost 7001 2 1",
            "127.0.0.1:7002".parse().unwrap(),
        );

        let remote = RemoteMembership::new(monitor.control_addr.to_string(), Duration::from_secs(2));
        assert_eq!(remote.refresh().await.unwrap(), 1);

        let id = NodeId::from("CS1");
        let snapshot = remote.snapshot();
        assert!(snapshot.is_alive(&id));
        assert_eq!(snapshot.get(&id).unwrap().load, 2);

        assert!(remote.apply_load(&id, 7));
        assert_eq!(remote.snapshot().get(&id).unwrap().load, 7);

        assert!(remote.mark_down(&id));
        assert!(!remote.snapshot().is_alive(&id));
        assert!(!remote.mark_down(&id));

        remote
            .register_for_notifications("127.0.0.1", 5999)
            .await
            .unwrap();
        assert!(remote.is_registered());
        assert_eq!(
            monitor.service.notifier.subscribers(),
            vec!["127.0.0.1:5999".to_string()]
        );

        monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_monitor_keeps_last_view() {
        let remote = RemoteMembership::new("127.0.0.1:1", Duration::from_millis(200));
        assert!(remote.refresh().await.is_err());
        assert!(remote.snapshot().is_empty());
    }
}
