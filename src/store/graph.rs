use std::collections::HashMap;

use rusqlite::{params, Connection, TransactionBehavior};

use crate::{
    error::{CoreError, CoreResult},
    models::{EdgeKind, GraphPrimitives, NodeKind, ReplaceSummary, SchemaEdge, SchemaGraph, SchemaNode},
};

/// Replaces the committed graph of `connection_id` in one transaction.
///
/// Old edges and nodes are deleted, the new nodes are inserted with fresh ids,
/// and edges are translated from node names to those ids. An edge naming a
/// node that is not part of `graph` is dropped. Any failure rolls the whole
/// transaction back and leaves the previous graph untouched.
pub fn replace(
    conn: &mut Connection,
    connection_id: i64,
    graph: &GraphPrimitives,
) -> CoreResult<ReplaceSummary> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute(
        "DELETE FROM schema_edges WHERE connection_id = ?1",
        params![connection_id],
    )?;
    tx.execute(
        "DELETE FROM schema_nodes WHERE connection_id = ?1",
        params![connection_id],
    )?;

    let mut summary = ReplaceSummary::default();
    let mut ids: HashMap<&str, i64> = HashMap::with_capacity(graph.nodes.len());
    {
        let mut insert_node = tx.prepare(
            "INSERT INTO schema_nodes(connection_id, name, kind, metadata_json) VALUES(?1, ?2, ?3, ?4)",
        )?;
        for node in &graph.nodes {
            let id = insert_node.insert(params![
                connection_id,
                node.name,
                node.kind.as_str(),
                node.metadata.to_string()
            ])?;
            ids.insert(node.name.as_str(), id);
            summary.nodes_written += 1;
        }
    }

    {
        let mut insert_edge = tx.prepare(
            "INSERT INTO schema_edges(connection_id, source_id, target_id, kind, metadata_json) VALUES(?1, ?2, ?3, ?4, ?5)",
        )?;
        for edge in &graph.edges {
            let (Some(source_id), Some(target_id)) = (
                ids.get(edge.source.as_str()),
                ids.get(edge.target.as_str()),
            ) else {
                summary.edges_dropped += 1;
                continue;
            };
            insert_edge.execute(params![
                connection_id,
                source_id,
                target_id,
                edge.kind.as_str(),
                edge.metadata.to_string()
            ])?;
            summary.edges_written += 1;
        }
    }

    tx.commit()?;
    Ok(summary)
}

/// Reads the committed graph of `connection_id`.
pub fn load(conn: &Connection, connection_id: i64) -> CoreResult<SchemaGraph> {
    let mut stmt = conn.prepare(
        "SELECT id, name, kind, metadata_json FROM schema_nodes WHERE connection_id = ?1 ORDER BY id",
    )?;
    let raw_nodes = stmt
        .query_map(params![connection_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut nodes = Vec::with_capacity(raw_nodes.len());
    for (id, name, kind, metadata) in raw_nodes {
        let kind = NodeKind::parse(&kind)
            .ok_or_else(|| CoreError::PersistenceFailure(format!("unknown node kind {kind}")))?;
        nodes.push(SchemaNode {
            id,
            connection_id,
            name,
            kind,
            metadata: serde_json::from_str(&metadata)?,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT id, source_id, target_id, kind, metadata_json FROM schema_edges WHERE connection_id = ?1 ORDER BY id",
    )?;
    let raw_edges = stmt
        .query_map(params![connection_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut edges = Vec::with_capacity(raw_edges.len());
    for (id, source_id, target_id, kind, metadata) in raw_edges {
        let kind = EdgeKind::parse(&kind)
            .ok_or_else(|| CoreError::PersistenceFailure(format!("unknown edge kind {kind}")))?;
        edges.push(SchemaEdge {
            id,
            connection_id,
            source_id,
            target_id,
            kind,
            metadata: serde_json::from_str(&metadata)?,
        });
    }

    Ok(SchemaGraph { nodes, edges })
}
