use std::path::{Path, PathBuf};

use clap::{Arg, ArgAction, Command};
use eyre::{Context, Result};

use tesseral::prelude::*;
use tesseral::mesh::InitFlag;
use tesseral::task::NoTasks;

fn main() -> Result<()> {
    let matches = Command::new("meshtest")
        .about("Construct a tesseral mesh hierarchy, report its structure, or drive it without physics.")
        .version("v0.1.0")
        .arg(
            Arg::new("input")
                .num_args(1)
                .short('i')
                .long("input")
                .help("Path to the TOML simulation input")
                .value_name("FILE")
                .required(true),
        )
        .arg(
            Arg::new("nranks")
                .num_args(1)
                .short('m')
                .long("nranks")
                .help("Mesh-test mode: balance for this many ranks and report, without allocating blocks")
                .value_name("NRANKS"),
        )
        .arg(
            Arg::new("output")
                .num_args(1)
                .short('o')
                .long("output")
                .help("Where to write the block-corner polylines in mesh-test mode")
                .value_name("FILE")
                .default_value("meshtest.dat"),
        )
        .arg(
            Arg::new("quiet")
                .long("quiet")
                .help("Suppress the per-block structure listing")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let input = PathBuf::from(matches.get_one::<String>("input").unwrap());
    let input = tesseral_app::file::abs_or_relative(&input)?;
    let config: SimulationConfig = tesseral_app::file::import_toml(&input)
        .wrap_err_with(|| format!("failed to load {}", input.display()))?;

    if let Some(nranks) = matches.get_one::<String>("nranks") {
        let nranks: usize = nranks.parse().wrap_err("--nranks must be an integer")?;
        return mesh_test(&config, nranks, Path::new(matches.get_one::<String>("output").unwrap()));
    }

    drive(&config, matches.get_flag("quiet"))
}

/// Constructs and balances the mesh for a pretended rank count, then prints
/// the structure report and writes the plotting polylines.
fn mesh_test(config: &SimulationConfig, nranks: usize, output: &Path) -> Result<()> {
    let mesh = Mesh::new_test(config, nranks)?;
    print!("{}", mesh.structure_report());
    if config.mesh.dim() >= 2 {
        mesh.write_meshtest_dat(output)?;
        log::info!("wrote {}", output.display());
    }
    Ok(())
}

/// Runs the mesh with a trivial state: a smooth density profile, a fixed
/// block time step, and an oscillation-based refinement criterion when the
/// mesh is adaptive. No physics is computed; this exercises construction,
/// exchanges, regridding, and the step loop.
fn drive(config: &SimulationConfig, quiet: bool) -> Result<()> {
    let mut mesh = Mesh::new(config, Box::new(SerialComm))?;

    let mut hooks = MeshHooks::new();
    hooks.enroll_problem_generator(|block| {
        let (nvar, nk, nj, ni) = block.data.u.dims();
        let size = &block.block_size;
        let dx = (size.x1max - size.x1min) / size.nx1 as f64;
        for n in 0..nvar {
            for k in 0..nk {
                for j in 0..nj {
                    for i in 0..ni {
                        let x = size.x1min + (i as f64 - block.is as f64 + 0.5) * dx;
                        block.data.u[(n, k, j, i)] =
                            1.0 + 0.1 * (2.0 * std::f64::consts::PI * x).sin();
                    }
                }
            }
        }
    });
    hooks.enroll_block_time_step(|block| {
        let size = &block.block_size;
        (size.x1max - size.x1min) / size.nx1 as f64
    });
    hooks.enroll_refinement_criterion(|block| {
        // Refine where the profile is steep, keep elsewhere.
        let mut extremum = 0.0_f64;
        for i in block.is..block.ie {
            let a = block.data.u[(0, block.ks, block.js, i)];
            let b = block.data.u[(0, block.ks, block.js, i + 1)];
            extremum = extremum.max((b - a).abs());
        }
        if extremum > 0.05 {
            RefinementFlag::Refine
        } else {
            RefinementFlag::Derefine
        }
    });

    mesh.initialize(InitFlag::Fresh, &hooks)?;
    log::info!(
        "initialized: {} blocks ({} cells), dt = {:.3e}",
        mesh.nbtotal,
        mesh.total_cells(),
        mesh.dt
    );

    while mesh.time < mesh.tlim && (mesh.nlim < 0 || mesh.ncycle < mesh.nlim) {
        mesh.update_one_step(&NoTasks);
        mesh.time += mesh.dt;
        mesh.ncycle += 1;

        if mesh.adaptive {
            mesh.flag_blocks_for_refinement(&hooks);
            mesh.adaptive_mesh_refinement(&hooks)?;
        }
        mesh.new_time_step();
    }

    log::info!(
        "finished: cycle {} at t = {:.6}, {} blocks",
        mesh.ncycle,
        mesh.time,
        mesh.nbtotal
    );
    if !quiet {
        print!("{}", mesh.structure_report());
        let totals = mesh.total_conserved();
        log::info!("total conserved: {totals:?}");
    }
    Ok(())
}
