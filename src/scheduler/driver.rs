use std::time::Instant;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array4, s};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::split::{Task, estimate_peak_bytes, preflight, split_tasks};
use crate::assemble::{DisaggOutput, assemble};
use crate::binning::{BinEdges, build_bin_edges};
use crate::config::DisaggConfig;
use crate::disagg::{DisaggMatrix, DisaggSeeds, DisaggStats, Disaggregator, compute_seeds};
use crate::error::{DisaggError, Result};
use crate::inputs::{GroundMotionModel, HazardInputs, check_poes};
use crate::pmap::curves::compute_hazard_curves;
use crate::realizations::RealizationWeights;
use crate::rupture::{RuptureContext, RuptureGroup};
use crate::runtime::{available_memory_bytes, bytes_to_gib, configure_thread_pool, current_rss_bytes};
use crate::site::SiteCollection;

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task: usize,
    pub grp_id: u16,
    pub trt: String,
    pub mag_bin: Option<usize>,
    pub ruptures: usize,
    pub weight: f64,
    pub stats: DisaggStats,
    pub t_exceedance: f64,
    pub t_disagg: f64,
    pub t_total: f64,
}

struct TaskOutput {
    report: TaskReport,
    /// `(site_idx * n_rlz + rlz, partial matrix)`.
    partials: Vec<(usize, DisaggMatrix)>,
}

/// Read-only state shared by every worker.
struct Shared<'a> {
    cfg: &'a DisaggConfig,
    sites: &'a SiteCollection,
    groups: &'a [RuptureGroup],
    seeds: &'a DisaggSeeds,
    edges: &'a BinEdges,
    model: &'a dyn GroundMotionModel,
    n_rlz: usize,
}

fn run_task(id: usize, task: &Task, sh: &Shared<'_>) -> Result<TaskOutput> {
    let t0 = Instant::now();
    let cfg = sh.cfg;
    let grp = &sh.groups[task.grp_idx];
    let max_dist = cfg.maximum_distance.get(&grp.trt);
    let n_eps = sh.edges.num_eps();
    let n_imt = cfg.imtls.len();
    let n_poe = cfg.poes_disagg.len();
    let dis = Disaggregator::new(sh.edges, cfg);

    let ctxs: Vec<&RuptureContext> = task.ctx_idx.iter().map(|&i| &grp.contexts[i]).collect();
    let mut slots: Vec<Option<DisaggMatrix>> = vec![None; sh.sites.len() * sh.n_rlz];
    let mut stats = DisaggStats::default();
    let (mut t_exceedance, mut t_disagg) = (0.0, 0.0);
    let mut close: Vec<&RuptureContext> = Vec::with_capacity(ctxs.len());

    for (pos, site) in sh.sites.iter().enumerate() {
        if !sh.seeds.is_site_active(pos) {
            continue;
        }
        close.clear();
        close.extend(
            ctxs.iter()
                .copied()
                .filter(|c| c.site_position(site.sid, max_dist).is_some()),
        );
        stats.far_away += ctxs.len() - close.len();
        if close.is_empty() {
            continue;
        }
        for rlz in sh.seeds.active_rlzs(pos) {
            let te = Instant::now();
            let mut exceedance = Array4::zeros((close.len(), n_eps, n_imt, n_poe));
            for m in 0..n_imt {
                for p in 0..n_poe {
                    let iml = sh.seeds.imls[[pos, rlz, m, p]];
                    let arr = sh
                        .model
                        .evaluate_exceedance(
                            &close,
                            site,
                            cfg.imtls.name(m),
                            iml,
                            cfg.truncation_level,
                            n_eps,
                            rlz,
                        )
                        .with_context(|| format!("site #{} rlz #{rlz}", site.sid))?;
                    check_poes(&arr, close.len(), n_eps, "evaluate_exceedance")?;
                    exceedance.slice_mut(s![.., .., m, p]).assign(&arr);
                }
            }
            t_exceedance += te.elapsed().as_secs_f64();

            let td = Instant::now();
            let matrix = slots[pos * sh.n_rlz + rlz].get_or_insert_with(|| {
                DisaggMatrix::for_mag_window(sh.edges.shape(pos), task.mag_range.clone(), n_imt, n_poe)
            });
            let st = dis.disaggregate(grp, &close, pos, site, max_dist, exceedance.view(), matrix)?;
            stats.absorb(st);
            t_disagg += td.elapsed().as_secs_f64();
        }
    }

    let partials = slots
        .into_iter()
        .enumerate()
        .filter_map(|(slot, m)| m.map(|m| (slot, m)))
        .collect();
    Ok(TaskOutput {
        report: TaskReport {
            task: id,
            grp_id: grp.grp_id,
            trt: grp.trt.clone(),
            mag_bin: task.mag_bin,
            ruptures: ctxs.len(),
            weight: task.weight,
            stats,
            t_exceedance,
            t_disagg,
            t_total: t0.elapsed().as_secs_f64(),
        },
        partials,
    })
}

fn load_groups(inputs: &dyn HazardInputs) -> Result<Vec<RuptureGroup>> {
    let mut groups = Vec::new();
    for grp_id in inputs.group_ids() {
        let grp = inputs
            .get_rupture_contexts(grp_id)
            .with_context(|| format!("loading rupture group #{grp_id}"))?;
        grp.validate()?;
        groups.push(grp);
    }
    Ok(groups)
}

fn progress_bar(len: usize, show: bool) -> ProgressBar {
    if !show {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::with_template("[{elapsed_precise}] {bar:40} {pos}/{len} tasks {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

/// Disaggregate the hazard of every site for every realization.
///
/// Either every `(site, realization)` with nonzero hazard gets normalized
/// matrices, or an error is returned and nothing is produced. When no site
/// has any hazard the output carries no edges and no results.
pub fn run(
    cfg: &DisaggConfig,
    inputs: &dyn HazardInputs,
    model: &dyn GroundMotionModel,
    weights: &RealizationWeights,
) -> Result<DisaggOutput> {
    let t0 = Instant::now();
    configure_thread_pool();
    cfg.validate()?;

    let sites = inputs.get_site_collection()?;
    if sites.is_empty() {
        return Err(DisaggError::invalid("the site collection is empty"));
    }
    if sites.len() > cfg.max_sites_disagg {
        return Err(DisaggError::TooManySites {
            num_sites: sites.len(),
            limit: cfg.max_sites_disagg,
        });
    }
    let n_rlz = weights.len();
    let groups = load_groups(inputs)?;
    info!(
        sites = sites.len(),
        groups = groups.len(),
        ruptures = groups.iter().map(|g| g.contexts.len()).sum::<usize>(),
        realizations = n_rlz,
        "starting disaggregation"
    );

    let curves = compute_hazard_curves(&groups, &sites, model, cfg, n_rlz)?;
    let seeds = compute_seeds(&curves, &sites, cfg)?;
    if seeds.num_active_sites() == 0 {
        info!("every site has zero hazard; nothing to disaggregate");
        return Ok(DisaggOutput {
            sids: sites.sids().to_vec(),
            imts: cfg.imtls.names().to_vec(),
            poes: cfg.poes_disagg.clone(),
            edges: None,
            results: Default::default(),
            task_reports: Vec::new(),
        });
    }

    let edges = build_bin_edges(&sites, &groups, cfg)?;
    let tasks = split_tasks(&groups, &edges, cfg);
    // bounded batches keep at most a few partial matrix sets alive at once
    let batch = (2 * rayon::current_num_threads()).max(1);
    let estimated = estimate_peak_bytes(&tasks, batch, &edges, &seeds, cfg);
    let available = match cfg.available_memory {
        Some(bytes) => bytes,
        None => available_memory_bytes().ok_or_else(|| {
            DisaggError::config("cannot read the available memory; set available_memory")
        })?,
    };
    preflight(estimated, available, cfg.memory_safety_margin)?;
    info!(
        tasks = tasks.len(),
        estimated_gib = bytes_to_gib(estimated),
        available_gib = bytes_to_gib(available),
        margin = cfg.memory_safety_margin,
        "memory pre-flight passed"
    );

    let shared = Shared {
        cfg,
        sites: &sites,
        groups: &groups,
        seeds: &seeds,
        edges: &edges,
        model,
        n_rlz,
    };

    let mut finals: Vec<Option<DisaggMatrix>> = vec![None; sites.len() * n_rlz];
    let mut reports = Vec::with_capacity(tasks.len());
    let pb = progress_bar(tasks.len(), cfg.show_progress);
    let (n_imt, n_poe) = (cfg.imtls.len(), cfg.poes_disagg.len());
    for (b, chunk) in tasks.chunks(batch).enumerate() {
        let outputs: Vec<TaskOutput> = chunk
            .par_iter()
            .enumerate()
            .map(|(k, task)| run_task(b * batch + k, task, &shared))
            .collect::<Result<_>>()?;

        for out in outputs {
            for (slot, partial) in out.partials {
                finals[slot]
                    .get_or_insert_with(|| {
                        DisaggMatrix::for_bins(edges.shape(slot / n_rlz), n_imt, n_poe)
                    })
                    .add_assign(&partial)?;
            }
            pb.set_message(format!("grp #{}", out.report.grp_id));
            reports.push(out.report);
            pb.inc(1);
        }
        if let Some(rss) = current_rss_bytes() {
            debug!(batch = b, rss_gib = bytes_to_gib(rss), "merged batch");
        }
    }
    pb.finish_and_clear();

    let mut totals = DisaggStats::default();
    for r in &reports {
        debug!(
            task = r.task,
            grp_id = r.grp_id,
            trt = %r.trt,
            mag_bin = ?r.mag_bin,
            ruptures = r.ruptures,
            weight = r.weight,
            far_away = r.stats.far_away,
            out_of_range = r.stats.out_of_range,
            "task exceedance={:.3}s disagg={:.3}s total={:.3}s",
            r.t_exceedance,
            r.t_disagg,
            r.t_total
        );
        totals.absorb(r.stats);
    }
    if totals.out_of_range > 0 {
        warn!(skipped = totals.out_of_range, "ruptures outside the bin edges were skipped");
    }

    let results = assemble(finals, &sites, &seeds, weights, cfg)?;
    info!(
        tasks = reports.len(),
        results = results.len(),
        wall_s = t0.elapsed().as_secs_f64(),
        "disaggregation done"
    );
    Ok(DisaggOutput {
        sids: sites.sids().to_vec(),
        imts: cfg.imtls.names().to_vec(),
        poes: cfg.poes_disagg.clone(),
        edges: Some(edges),
        results,
        task_reports: reports,
    })
}
