use std::sync::Arc;

use clap::{value_parser, Arg, ArgMatches, Command};
use log::info;

use nachos_vmfs::device::BlockFile;
use nachos_vmfs::fs::{FileSystem, SynchDisk, NUM_SECTORS};
use nachos_vmfs::vm::{VirtualMemoryManager, VmConfig, PAGE_SIZE};
use nachos_vmfs::{logging, Result};

fn cli() -> Command {
    let name = || Arg::new("name").required(true).help("File name inside the disk image");
    Command::new("nachos-vmfs")
        .about("Nachos disk image tool: file system and demand-paged loader")
        .arg(
            Arg::new("image")
                .short('i')
                .long("image")
                .default_value("disk.img")
                .help("Disk image on the host"),
        )
        .arg(
            Arg::new("log")
                .long("log")
                .help("Log level (error, warn, info, debug, trace), overrides $LOG"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("format").about("Create an empty file system"))
        .subcommand(
            Command::new("cp")
                .about("Copy a host file into the current directory")
                .arg(Arg::new("host").required(true).help("Host file"))
                .arg(name()),
        )
        .subcommand(Command::new("ls").about("List the current directory"))
        .subcommand(Command::new("cat").about("Print a file").arg(name()))
        .subcommand(Command::new("rm").about("Remove a file or an empty directory").arg(name()))
        .subcommand(Command::new("mkdir").about("Create a directory").arg(name()))
        .subcommand(Command::new("cd").about("Change the current directory, `..` for parent").arg(name()))
        .subcommand(Command::new("print").about("Dump bitmap, directory and file contents"))
        .subcommand(
            Command::new("run")
                .about("Demand-page every page of a NOFF executable and print paging statistics")
                .arg(name())
                .arg(
                    Arg::new("frames")
                        .long("frames")
                        .value_parser(value_parser!(u64).range(1..))
                        .help("Number of physical frames"),
                )
                .arg(
                    Arg::new("tlb")
                        .long("tlb")
                        .value_parser(value_parser!(u64).range(1..))
                        .help("Number of TLB entries"),
                ),
        )
}

fn main() {
    let matches = cli().get_matches();
    logging::init(matches.get_one::<String>("log").map(String::as_str));
    if let Err(e) = run(&matches) {
        eprintln!("nachos-vmfs: {}", e);
        std::process::exit(1);
    }
}

/// 取一个必填的字符串参数
fn arg<'a>(matches: &'a ArgMatches, id: &str) -> &'a str {
    matches
        .get_one::<String>(id)
        .map(String::as_str)
        .unwrap_or_default()
}

fn run(matches: &ArgMatches) -> Result<()> {
    let image = arg(matches, "image");
    let device = Arc::new(BlockFile::open(image, NUM_SECTORS)?);
    let disk = SynchDisk::new(device);

    let (cmd, sub) = match matches.subcommand() {
        Some(pair) => pair,
        None => return Ok(()),
    };
    if cmd == "format" {
        FileSystem::format(disk)?;
        println!("formatted {}", image);
        return Ok(());
    }

    let mut fs = FileSystem::mount(disk)?;
    match cmd {
        "cp" => {
            let data = std::fs::read(arg(sub, "host"))?;
            let name = arg(sub, "name");
            fs.create(name, data.len())?;
            let file = fs.open(name)?;
            file.write_at(&data, 0);
            info!("copied {} bytes into {}", data.len(), name);
        }
        "ls" => {
            for name in fs.list()? {
                println!("{}", name);
            }
        }
        "cat" => {
            let file = fs.open(arg(sub, "name"))?;
            println!("{}", String::from_utf8_lossy(&file.read_all()));
        }
        "rm" => fs.remove(arg(sub, "name"))?,
        "mkdir" => fs.create_dir(arg(sub, "name"), 0)?,
        "cd" => {
            fs.change(arg(sub, "name"))?;
            println!("{}", fs.current_path()?);
        }
        "print" => fs.print()?,
        "run" => {
            let mut config = VmConfig::default();
            if let Some(&frames) = sub.get_one::<u64>("frames") {
                config.num_phys_pages = frames as usize;
            }
            if let Some(&tlb) = sub.get_one::<u64>("tlb") {
                config.tlb_size = tlb as usize;
            }
            let name = arg(sub, "name");
            let mut vm = VirtualMemoryManager::new(config);
            vm.exec(&fs, 1, name)?;
            let num_pages = vm.space(1).map_or(0, |space| space.num_pages());
            for vpn in 0..num_pages {
                vm.read_mem((vpn * PAGE_SIZE) as u32, 1)?;
            }
            println!("{}: {} pages", name, num_pages);
            vm.print_stats();
            vm.clear_map(1)?;
        }
        _ => unreachable!("subcommand {} is not registered", cmd),
    }
    Ok(())
}
