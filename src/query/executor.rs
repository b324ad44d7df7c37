//! Query executor.
//!
//! Evaluates parsed statements against the grid index through an explicit
//! [`QueryContext`] — the index handles are owned by the caller and threaded
//! through every evaluation, never global. The executor is single-threaded
//! per query; parallelism lives inside the grid's scan workers.
//!
//! Sub-statement filters keep two caches for the lifetime of one query:
//! the set of cells already scanned and the set of ids touched by matching
//! inner features. Each cell is therefore scanned at most once per
//! sub-statement, however many outer features hit it.

use std::collections::HashSet;

use crate::error::{OsmGridError, Result};
use crate::geometry::BoundingBox;
use crate::grid::{CellIndex, GridIndex};
use crate::model::{Feature, ObjectType};
use crate::tag_index::TagIndex;

use super::parser::{FilterExpr, Location, Statement, SubStatement, TypeSelector};

/// Everything a query evaluation needs, passed explicitly.
pub struct QueryContext<'a> {
    pub grid: &'a GridIndex,
    pub tags: &'a TagIndex,
}

/// Evaluate statements and return matching features, deduplicated by
/// (object-type, id) across the whole query.
pub fn execute(statements: &mut [Statement], ctx: &QueryContext) -> Result<Vec<Feature>> {
    let mut results = Vec::new();
    let mut seen: HashSet<(ObjectType, u64)> = HashSet::new();

    for statement in statements.iter_mut() {
        let Location::Bbox(bbox) = statement.location;
        match statement.selector {
            TypeSelector::Nodes | TypeSelector::Ways => {
                execute_geometry_statement(statement, &bbox, ctx, &mut seen, &mut results)?;
            }
            TypeSelector::Relations => {
                execute_relation_statement(statement, &bbox, ctx, &mut seen, &mut results)?;
            }
            TypeSelector::ChildRelations => {
                // The parser rejects this at the top level.
                return Err(OsmGridError::Unsupported(
                    "child_relations is not a top-level selector".to_string(),
                ));
            }
        }
    }
    Ok(results)
}

/// Nodes and ways: stream the bbox cells, gate on geometry, apply the filter.
fn execute_geometry_statement(
    statement: &mut Statement,
    bbox: &BoundingBox,
    ctx: &QueryContext,
    seen: &mut HashSet<(ObjectType, u64)>,
    results: &mut Vec<Feature>,
) -> Result<()> {
    let object_type = statement.selector.object_type();
    let stream = ctx.grid.query_bbox(bbox, object_type);
    for batch in stream {
        for feature in batch?.features {
            if !geometry_matches(bbox, &feature) {
                continue;
            }
            if !eval_filter(&mut statement.filter, &feature, ctx)? {
                continue;
            }
            if seen.insert(feature.dedup_key()) {
                results.push(feature);
            }
        }
    }
    Ok(())
}

/// Relations store member ids without coordinates, so the bbox gate is
/// member presence: a relation intersects the bbox when one of its member
/// nodes or ways does. Matching members are collected from the bbox cells
/// first, then the single relation file is scanned once.
fn execute_relation_statement(
    statement: &mut Statement,
    bbox: &BoundingBox,
    ctx: &QueryContext,
    seen: &mut HashSet<(ObjectType, u64)>,
    results: &mut Vec<Feature>,
) -> Result<()> {
    let mut present: HashSet<(ObjectType, u64)> = HashSet::new();
    for object_type in [ObjectType::Node, ObjectType::Way] {
        let stream = ctx.grid.query_bbox(bbox, object_type);
        for batch in stream {
            for feature in batch?.features {
                if geometry_matches(bbox, &feature) {
                    present.insert(feature.dedup_key());
                }
            }
        }
    }

    for relation in ctx.grid.scan_relations()? {
        let in_bbox = relation
            .node_ids
            .iter()
            .any(|&id| present.contains(&(ObjectType::Node, id)))
            || relation
                .way_ids
                .iter()
                .any(|&id| present.contains(&(ObjectType::Way, id)));
        if !in_bbox {
            continue;
        }
        let feature = Feature::Relation(relation);
        if !eval_filter(&mut statement.filter, &feature, ctx)? {
            continue;
        }
        if seen.insert(feature.dedup_key()) {
            results.push(feature);
        }
    }
    Ok(())
}

fn geometry_matches(bbox: &BoundingBox, feature: &Feature) -> bool {
    match feature {
        Feature::Node(n) => bbox.contains(n.lon as f64, n.lat as f64),
        Feature::Way(w) => bbox.intersects(&w.bounding_box()),
        // Relations are gated by member presence before filtering.
        Feature::Relation(_) => true,
    }
}

/// Evaluate a filter against one feature. `&mut` because sub-statement
/// caches grow during evaluation.
pub fn eval_filter(
    filter: &mut FilterExpr,
    feature: &Feature,
    ctx: &QueryContext,
) -> Result<bool> {
    match filter {
        FilterExpr::Const(value) => Ok(*value),
        FilterExpr::HasKey(key_id) => Ok(feature.has_key(*key_id)),
        FilterExpr::NotHasKey(key_id) => Ok(!feature.has_key(*key_id)),
        FilterExpr::Compare {
            key_id,
            op,
            value_id,
        } => Ok(feature
            .tag_value(*key_id)
            .map(|v| op.eval(v, *value_id))
            .unwrap_or(false)),
        FilterExpr::And(left, right) => {
            Ok(eval_filter(left, feature, ctx)? && eval_filter(right, feature, ctx)?)
        }
        FilterExpr::Or(left, right) => {
            Ok(eval_filter(left, feature, ctx)? || eval_filter(right, feature, ctx)?)
        }
        FilterExpr::Not(inner) => Ok(!eval_filter(inner, feature, ctx)?),
        FilterExpr::Sub(sub) => eval_sub_statement(sub, feature, ctx),
    }
}

/// Context-aware sub-statement: does any id the outer feature touches appear
/// among the ids touched by an inner feature matching the inner filter?
///
/// For node/way inner selectors, candidate features come from the cells of
/// the outer feature's members; cells already in `cached_cells` are not
/// fetched again. Relation selectors scan the single relation file once per
/// sub-statement lifetime.
fn eval_sub_statement(
    sub: &mut SubStatement,
    outer: &Feature,
    ctx: &QueryContext,
) -> Result<bool> {
    match sub.selector {
        TypeSelector::Nodes | TypeSelector::Ways => {
            let cells = ctx.grid.feature_cells(outer)?;
            let missing: Vec<CellIndex> = cells
                .iter()
                .filter(|c| !sub.cached_cells.contains(c))
                .copied()
                .collect();
            if !missing.is_empty() {
                let stream = ctx
                    .grid
                    .query_cells(missing.clone(), sub.selector.object_type());
                for batch in stream {
                    for candidate in batch?.features {
                        if eval_filter(&mut sub.filter, &candidate, ctx)? {
                            sub.id_cache.extend(candidate.context_ids());
                        }
                    }
                }
                sub.cached_cells.extend(missing);
            }
            Ok(outer
                .context_ids()
                .iter()
                .any(|id| sub.id_cache.contains(id)))
        }
        TypeSelector::Relations => {
            scan_relations_into_cache(sub, ctx, false)?;
            Ok(outer
                .context_ids()
                .iter()
                .any(|id| sub.id_cache.contains(id)))
        }
        TypeSelector::ChildRelations => {
            // Only the matching relations' own ids count here: the outer
            // relation must reference a matching child directly.
            scan_relations_into_cache(sub, ctx, true)?;
            match outer {
                Feature::Relation(r) => Ok(r
                    .child_relation_ids
                    .iter()
                    .any(|&id| sub.id_cache.contains(&(ObjectType::Relation, id)))),
                other => Err(OsmGridError::Unsupported(format!(
                    "this.child_relations requires a relation context, not a {}",
                    other.object_type().dir_name()
                ))),
            }
        }
    }
}

fn scan_relations_into_cache(
    sub: &mut SubStatement,
    ctx: &QueryContext,
    own_ids_only: bool,
) -> Result<()> {
    if sub.relations_scanned {
        return Ok(());
    }
    for relation in ctx.grid.scan_relations()? {
        let feature = Feature::Relation(relation);
        if eval_filter(&mut sub.filter, &feature, ctx)? {
            if own_ids_only {
                sub.id_cache.insert(feature.dedup_key());
            } else {
                sub.id_cache.extend(feature.context_ids());
            }
        }
    }
    sub.relations_scanned = true;
    Ok(())
}
