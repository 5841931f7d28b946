//! Command Dispatcher
//!
//! Maps one decoded command from one session to world mutations and the
//! deliveries they cause. Runs with the world lock held and sends nothing
//! itself; the caller pushes the returned deliveries after unlocking.

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::coord::chunk_addr_of;
use crate::network::protocol::{
    BlockSetParams, ChatMessage, ChatSendParams, ChunkPosParams, Command, CorrelationId,
    LoadChestParams, Packet, PlayerStateInfo, PlayerStateParams, ServerMessage,
    SetChestSlotItemParams,
};
use crate::network::session::{ConnectionSerial, Outbox, SessionId};
use crate::world::broadcast::{send_all, send_selected, Delivery};
use crate::world::chunk::{check_block_change, ChunkError};
use crate::world::instance::{World, WorldError, WorldInner};

/// The session a command came from.
struct Origin {
    id: SessionId,
    username: String,
    outbox: Outbox,
    correlation: Option<CorrelationId>,
}

impl Origin {
    fn reply(&self, message: ServerMessage) -> Delivery {
        Delivery::unicast(
            self.outbox.clone(),
            vec![Packet::reply(message, self.correlation.clone())],
        )
    }
}

/// Route a command from connection `serial` of `sender`.
///
/// Commands from a session that is no longer registered, or from a
/// connection that was replaced under the same identity, are dropped.
pub(crate) fn route(
    world: &World,
    inner: &mut WorldInner,
    command: Command,
    sender: SessionId,
    serial: ConnectionSerial,
    correlation: Option<CorrelationId>,
) -> Result<Vec<Delivery>, WorldError> {
    let Some(session) = inner.sessions.get(&sender) else {
        debug!("Dropping {} from unregistered session {}", command.name(), sender);
        return Ok(Vec::new());
    };
    if session.serial() != serial {
        debug!("Dropping {} from replaced connection of {}", command.name(), sender);
        return Ok(Vec::new());
    }
    let origin = Origin {
        id: sender,
        username: session.profile.username.clone(),
        outbox: session.outbox(),
        correlation,
    };

    match command {
        Command::BlockSet(params) => block_set(world, inner, &origin, params),
        Command::CreateEntity(params) => create_entity(world, inner, &origin, params),
        Command::ChunkAdd(params) => chunk_add(inner, &origin, params),
        Command::ChunkRemove(params) => {
            inner.chunks.unsubscribe(params.pos, &origin.id);
            Ok(Vec::new())
        }
        Command::ChatSendMessage(params) => Ok(vec![chat(inner, &origin, params)]),
        Command::PlayerState(params) => Ok(vec![player_state(inner, &origin, params)]),
        Command::LoadChest(params) => load_chest(inner, &origin, params),
        Command::SetChestSlotItem(params) => set_chest_slot_item(inner, &origin, params),
        Command::Ping => Ok(vec![origin.reply(ServerMessage::Pong {
            server_time: Utc::now().timestamp_millis(),
        })]),
        Command::Connect(_) => {
            debug!("Ignoring repeated handshake from {}", origin.id);
            Ok(Vec::new())
        }
        Command::Unknown(name) => {
            debug!("Ignoring unknown command {:?} from {}", name, origin.id);
            Ok(Vec::new())
        }
    }
}

fn block_set(
    world: &World,
    inner: &mut WorldInner,
    origin: &Origin,
    params: BlockSetParams,
) -> Result<Vec<Delivery>, WorldError> {
    let applied = inner.chunks.apply_block_change(params, world.is_admin(&origin.id))?;
    debug!("{} set block {} at {}", origin.username, applied.change.item.id, applied.change.pos);

    let orphaned = applied
        .replaced
        .as_ref()
        .and_then(|old| old.entity_id.as_deref())
        .filter(|old| applied.change.item.entity_id.as_deref() != Some(*old));
    if let Some(entity_id) = orphaned {
        if let Err(e) = inner.entities.remove_entity(entity_id) {
            warn!("Failed to remove entity {} at {}: {}", entity_id, applied.change.pos, e);
        }
    }

    Ok(vec![send_selected(
        &inner.sessions,
        vec![Packet::new(ServerMessage::BlockSet(applied.change))],
        &applied.observers,
        &[],
    )])
}

fn create_entity(
    world: &World,
    inner: &mut WorldInner,
    origin: &Origin,
    mut params: BlockSetParams,
) -> Result<Vec<Delivery>, WorldError> {
    check_block_change(&params.item, world.is_admin(&origin.id))?;

    // Load first so a failed load leaves no entity behind.
    let addr = chunk_addr_of(params.pos);
    let resident = inner.chunks.get(&addr).is_some();
    inner.chunks.get_or_create(addr).map_err(ChunkError::Load)?;
    if let Err(e) = inner.entities.create_entity(&mut params.item) {
        if !resident {
            inner.chunks.release_if_unobserved(addr);
        }
        return Err(e.into());
    }
    block_set(world, inner, origin, params)
}

fn chunk_add(inner: &mut WorldInner, origin: &Origin, params: ChunkPosParams) -> Result<Vec<Delivery>, WorldError> {
    let replay = inner.chunks.subscribe(params.pos, origin.id)?;
    Ok(vec![origin.reply(ServerMessage::ChunkLoaded(replay))])
}

fn chat(inner: &WorldInner, origin: &Origin, params: ChatSendParams) -> Delivery {
    let message = ChatMessage {
        username: origin.username.clone(),
        text: params.text,
    };
    send_all(
        &inner.sessions,
        vec![Packet::new(ServerMessage::ChatSendMessage(message))],
        &[origin.id],
    )
}

fn player_state(inner: &mut WorldInner, origin: &Origin, params: PlayerStateParams) -> Delivery {
    if let Some(session) = inner.sessions.get_mut(&origin.id) {
        session.pos = params.pos;
        session.rotate = params.rotate;
    }

    let state = PlayerStateInfo {
        id: origin.id,
        username: origin.username.clone(),
        pos: params.pos,
        rotate: params.rotate,
    };
    send_all(
        &inner.sessions,
        vec![Packet::new(ServerMessage::PlayerState(state))],
        &[origin.id],
    )
}

fn load_chest(inner: &mut WorldInner, origin: &Origin, params: LoadChestParams) -> Result<Vec<Delivery>, WorldError> {
    let chest = inner.entities.load_chest(&params, &origin.id)?;
    Ok(vec![origin.reply(ServerMessage::ChestContent(chest))])
}

fn set_chest_slot_item(
    inner: &mut WorldInner,
    origin: &Origin,
    params: SetChestSlotItemParams,
) -> Result<Vec<Delivery>, WorldError> {
    let update = inner.entities.set_chest_slot_item(&params, &origin.id)?;
    Ok(vec![send_selected(
        &inner.sessions,
        vec![Packet::new(ServerMessage::ChestContent(update.chest))],
        &update.viewers,
        &[],
    )])
}
