//! Logos collab simulator — three in-process clients on one canvas.
//!
//! Runs the concurrent-edit scenario (A creates, B and C edit the same
//! rectangle at once) and a presence/cursor/drag round that ends with one
//! client vanishing without saying goodbye. Set `RUST_LOG=debug` for detail;
//! `LOGOS_*` variables override the sync tunables.

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use logos_canvas::{CanvasId, NewShape, ShapePatch};
use logos_collab::{
    CollabClient, CursorPosition, EphemeralStore, MemoryShapeStore, StaticIdentity, SyncConfig,
    UserIdentity,
};

const SESSION: &str = "demo-session";

fn client(
    store: &Arc<MemoryShapeStore>,
    ephemeral: &Arc<EphemeralStore>,
    id: &str,
    name: &str,
    config: &SyncConfig,
) -> CollabClient {
    CollabClient::new(
        store.clone(),
        ephemeral,
        Arc::new(StaticIdentity::signed_in(UserIdentity::new(id, name))),
        config.clone(),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = SyncConfig::from_env()?;
    info!("Starting Logos collab simulator ({:?} locks)", config.lock_policy);

    let store = Arc::new(MemoryShapeStore::new());
    let ephemeral = EphemeralStore::new(config.channel_capacity);
    let _reaper = ephemeral.spawn_reaper(config.reaper_interval(), config.liveness_timeout());
    let canvas = CanvasId::from("demo");

    let a = client(&store, &ephemeral, "user-a", "Ada", &config);
    let b = client(&store, &ephemeral, "user-b", "Brian", &config);
    let c = client(&store, &ephemeral, "user-c", "Chen", &config);

    // ─── Concurrent edits ─────────────────────────────────────────────

    let rect = a
        .create_shape(&canvas, NewShape::rectangle(100.0, 100.0, 200.0, 120.0))
        .await?;
    info!("A created {}", rect.id);

    b.get_canvas_state(&canvas).await?;
    c.get_canvas_state(&canvas).await?;

    let (moved, filled) = tokio::join!(
        b.update_shape(&canvas, &rect.id, ShapePatch::position(300.0, 240.0)),
        c.update_shape(&canvas, &rect.id, ShapePatch::fill("#EF4444")),
    );
    let moved = moved?;
    let filled = filled?;

    let doc = a.get_canvas_state(&canvas).await?;
    let Some(winner) = doc.shape(&rect.id) else {
        return Err(format!("{} vanished from {}", rect.id, canvas).into());
    };
    let who = if (winner.x, winner.y, &winner.fill) == (moved.x, moved.y, &moved.fill) {
        "B"
    } else if (winner.x, winner.y, &winner.fill) == (filled.x, filled.y, &filled.fill) {
        "C"
    } else {
        "nobody"
    };
    info!(
        "Final record v{}: x={} y={} fill={} (won by {})",
        doc.version, winner.x, winner.y, winner.fill, who
    );

    // ─── Presence, cursors, drags ─────────────────────────────────────

    let online = Arc::new(Mutex::new(Vec::new()));
    let sink = online.clone();
    let _presence = a.subscribe_to_online_users(SESSION, move |users| {
        let names: Vec<String> = users.iter().map(|u| u.entry.display_name.clone()).collect();
        info!("Online: {}", names.join(", "));
        if let Ok(mut slot) = sink.lock() {
            *slot = names;
        }
    });
    let _cursors = a.subscribe_to_user_cursors(SESSION, |cursors| {
        for remote in cursors {
            info!(
                "  cursor {} at ({:.0}, {:.0})",
                remote.user_id, remote.cursor.canvas_x, remote.cursor.canvas_y
            );
        }
    });
    let _drags = a.subscribe_to_drag_states(SESSION, |drags| {
        for d in drags {
            info!("  {} dragging {}", d.dragged_by, d.shape_id);
        }
    });

    for peer in [&a, &b, &c] {
        peer.set_user_online(SESSION)?;
    }
    for step in 0..5 {
        let t = step as f64 * 10.0;
        b.throttled_update_user_cursor(SESSION, CursorPosition::new(t, t, t, t));
        c.set_shape_drag_state(SESSION, &rect.id, true, Some((300.0 + t, 240.0)));
        tokio::time::sleep(config.cursor_throttle()).await;
    }
    c.set_shape_drag_state(SESSION, &rect.id, false, None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    b.close(SESSION);
    info!("B left gracefully");

    drop(c);
    warn!("C dropped without leaving");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let remaining = online.lock().map(|names| names.clone()).unwrap_or_default();
    info!("Still online: {:?}", remaining);
    a.close(SESSION);
    info!("Simulation finished, {} ephemeral entr(ies) left", ephemeral.len());
    Ok(())
}
