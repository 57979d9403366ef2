//! State / Payload / Entity envelope
//!
//! A message body is a `State` table holding a vector of `Payload` tables.
//! Each payload carries one complete, independently decodable `Entity`
//! buffer as a byte vector. The entity buffer holds the union tag and the
//! concrete record table.

use super::entity::{
    BoundingBox, Entity, EntityKind, Headset, Node, Presenter, Robot, SubscriptionMask,
    SubscriptionRate, Vec3, Vec4,
};
use super::table::{self, DecodeError, EncodeError, TableBuilder, TableRef};

mod slot {
    pub const STATE_PAYLOAD: u16 = 0;
    pub const PAYLOAD_DATA: u16 = 0;

    pub const ENTITY_TYPE: u16 = 0;
    pub const ENTITY_VALUE: u16 = 1;

    pub const ROBOT_ID: u16 = 0;
    pub const ROBOT_NAME: u16 = 1;
    pub const ROBOT_SUBSCRIPTION: u16 = 2;
    pub const ROBOT_RATE: u16 = 3;
    pub const ROBOT_BOUNDING_BOX: u16 = 4;
    pub const ROBOT_COLOUR: u16 = 5;

    pub const BOX_CENTRE: u16 = 0;
    pub const BOX_DIMENSIONS: u16 = 1;
    pub const BOX_ROTATION: u16 = 2;
    pub const BOX_ELLIPSOID: u16 = 3;

    pub const NODE_ID: u16 = 0;
    pub const NODE_POSITION: u16 = 1;
    pub const NODE_ROTATION: u16 = 2;
    pub const NODE_VELOCITY: u16 = 3;
    pub const NODE_ERROR: u16 = 4;

    // Presenter and Headset share one layout
    pub const CLIENT_ID: u16 = 0;
    pub const CLIENT_NAME: u16 = 1;
    pub const CLIENT_SUBSCRIPTION: u16 = 2;
    pub const CLIENT_RATE: u16 = 3;
}

/// Serialize one entity into a standalone buffer
pub fn encode_entity(entity: &Entity) -> Result<Vec<u8>, EncodeError> {
    let record = match entity {
        Entity::Robot(robot) => robot_table(robot),
        Entity::Node(node) => node_table(node),
        Entity::Presenter(p) => client_table(p.id, &p.name, p.subscription, p.rate),
        Entity::Headset(h) => client_table(h.id, &h.name, h.subscription, h.rate),
    };

    TableBuilder::new()
        .u8(slot::ENTITY_TYPE, entity.kind() as u8)
        .table(slot::ENTITY_VALUE, record)
        .finish()
}

/// Wrap encoded entity buffers into a single `State` message body
pub fn encode_payload(entities: &[Vec<u8>]) -> Result<Vec<u8>, EncodeError> {
    let payloads = entities
        .iter()
        .map(|bytes| TableBuilder::new().bytes(slot::PAYLOAD_DATA, bytes.clone()))
        .collect();

    TableBuilder::new()
        .tables(slot::STATE_PAYLOAD, payloads)
        .finish()
}

/// Encode entities and wrap them in one message body
pub fn encode_state(entities: &[Entity]) -> Result<Vec<u8>, EncodeError> {
    let encoded = entities
        .iter()
        .map(encode_entity)
        .collect::<Result<Vec<_>, _>>()?;
    encode_payload(&encoded)
}

/// Decode every known entity in a message body
///
/// Payloads without data, entities with an unrecognised union tag and
/// entities carrying an unknown enum value are skipped. Any structural
/// damage fails the whole body.
pub fn decode_state(bytes: &[u8]) -> Result<Vec<Entity>, DecodeError> {
    let state = table::root(bytes)?;
    let mut entities = Vec::new();

    for payload in state.tables(slot::STATE_PAYLOAD)? {
        let Some(data) = payload.bytes(slot::PAYLOAD_DATA)? else {
            continue;
        };
        match decode_entity(data) {
            Ok(Some(entity)) => entities.push(entity),
            Ok(None) => {}
            Err(DecodeError::UnknownEnum { kind, value }) => {
                tracing::debug!("Skipping entity with unknown {} value {}", kind, value);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(entities)
}

/// Decode one standalone entity buffer, `None` for unknown kinds
pub fn decode_entity(bytes: &[u8]) -> Result<Option<Entity>, DecodeError> {
    let root = table::root(bytes)?;
    let tag = root.u8(slot::ENTITY_TYPE, 0)?;

    let Some(kind) = EntityKind::from_tag(tag) else {
        tracing::debug!("Skipping entity with unknown union tag {}", tag);
        return Ok(None);
    };
    let record = root
        .table(slot::ENTITY_VALUE)?
        .ok_or(DecodeError::MissingField("entity"))?;

    let entity = match kind {
        EntityKind::Robot => Entity::Robot(read_robot(&record)?),
        EntityKind::Node => Entity::Node(read_node(&record)?),
        EntityKind::Presenter => {
            let (id, name, subscription, rate) = read_client(&record)?;
            Entity::Presenter(Presenter {
                id,
                name,
                subscription,
                rate,
            })
        }
        EntityKind::Headset => {
            let (id, name, subscription, rate) = read_client(&record)?;
            Entity::Headset(Headset {
                id,
                name,
                subscription,
                rate,
            })
        }
    };

    Ok(Some(entity))
}

fn robot_table(robot: &Robot) -> TableBuilder {
    let bb = &robot.bounding_box;
    let bounding_box = TableBuilder::new()
        .f32s(slot::BOX_CENTRE, &bb.centre.to_array())
        .f32s(slot::BOX_DIMENSIONS, &bb.dimensions.to_array())
        .f32s(slot::BOX_ROTATION, &bb.rotation.to_array())
        .bool(slot::BOX_ELLIPSOID, bb.ellipsoid);

    TableBuilder::new()
        .u64(slot::ROBOT_ID, robot.id)
        .string(slot::ROBOT_NAME, &robot.name)
        .u16(slot::ROBOT_SUBSCRIPTION, robot.subscription.bits())
        .u8(slot::ROBOT_RATE, robot.rate as u8)
        .table(slot::ROBOT_BOUNDING_BOX, bounding_box)
        .u32(slot::ROBOT_COLOUR, robot.colour)
}

fn node_table(node: &Node) -> TableBuilder {
    TableBuilder::new()
        .u64(slot::NODE_ID, node.id)
        .f32s(slot::NODE_POSITION, &node.position.to_array())
        .f32s(slot::NODE_ROTATION, &node.rotation.to_array())
        .f32s(slot::NODE_VELOCITY, &node.velocity.to_array())
        .f32(slot::NODE_ERROR, node.error)
}

fn client_table(
    id: u64,
    name: &str,
    subscription: SubscriptionMask,
    rate: SubscriptionRate,
) -> TableBuilder {
    TableBuilder::new()
        .u64(slot::CLIENT_ID, id)
        .string(slot::CLIENT_NAME, name)
        .u16(slot::CLIENT_SUBSCRIPTION, subscription.bits())
        .u8(slot::CLIENT_RATE, rate as u8)
}

fn read_rate(table: &TableRef<'_>, slot: u16) -> Result<SubscriptionRate, DecodeError> {
    let value = table.u8(slot, SubscriptionRate::Full as u8)?;
    SubscriptionRate::from_u8(value).ok_or(DecodeError::UnknownEnum {
        kind: "SubscriptionRate",
        value,
    })
}

fn read_vec3(table: &TableRef<'_>, slot: u16) -> Result<Vec3, DecodeError> {
    Ok(table.f32s::<3>(slot)?.map(Vec3::from_array).unwrap_or_default())
}

fn read_vec4(table: &TableRef<'_>, slot: u16) -> Result<Vec4, DecodeError> {
    Ok(table.f32s::<4>(slot)?.map(Vec4::from_array).unwrap_or_default())
}

fn read_robot(table: &TableRef<'_>) -> Result<Robot, DecodeError> {
    let bounding_box = match table.table(slot::ROBOT_BOUNDING_BOX)? {
        Some(bb) => BoundingBox {
            centre: read_vec3(&bb, slot::BOX_CENTRE)?,
            dimensions: read_vec3(&bb, slot::BOX_DIMENSIONS)?,
            rotation: read_vec4(&bb, slot::BOX_ROTATION)?,
            ellipsoid: bb.bool(slot::BOX_ELLIPSOID, false)?,
        },
        None => BoundingBox::default(),
    };

    Ok(Robot {
        id: table.u64(slot::ROBOT_ID, 0)?,
        name: table.str(slot::ROBOT_NAME)?.unwrap_or_default().to_owned(),
        subscription: SubscriptionMask::from_bits(table.u16(slot::ROBOT_SUBSCRIPTION, 0)?),
        rate: read_rate(table, slot::ROBOT_RATE)?,
        bounding_box,
        colour: table.u32(slot::ROBOT_COLOUR, 0)?,
    })
}

fn read_node(table: &TableRef<'_>) -> Result<Node, DecodeError> {
    Ok(Node {
        id: table.u64(slot::NODE_ID, 0)?,
        position: read_vec3(table, slot::NODE_POSITION)?,
        rotation: read_vec4(table, slot::NODE_ROTATION)?,
        velocity: read_vec3(table, slot::NODE_VELOCITY)?,
        error: table.f32(slot::NODE_ERROR, 0.0)?,
    })
}

fn read_client(
    table: &TableRef<'_>,
) -> Result<(u64, String, SubscriptionMask, SubscriptionRate), DecodeError> {
    Ok((
        table.u64(slot::CLIENT_ID, 0)?,
        table.str(slot::CLIENT_NAME)?.unwrap_or_default().to_owned(),
        SubscriptionMask::from_bits(table.u16(slot::CLIENT_SUBSCRIPTION, 0)?),
        read_rate(table, slot::CLIENT_RATE)?,
    ))
}
