use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use log::info;
use mftfs::dump::{hexdump, render_block_usage, render_tree};
use mftfs::{BlockAllocationTable, BlockAllocationTableBuilder, InodeTree, Result};

/// Builds a small filesystem, deletes parts of it and persists the result.
#[derive(Parser, Debug)]
#[command(name = "create_and_delete")]
struct Args {
    /// Where to write the master file table.
    mft: PathBuf,
    /// Where to keep the block allocation table. It is formatted on start.
    bat: PathBuf,
}

fn report(what: &str, result: Result<()>) {
    match result {
        Ok(()) => println!("{}: deletion succeeded", what),
        Err(e) => println!("{}: deletion failed ({})", what, e),
    }
}

fn print_state(fs: &InodeTree<BlockAllocationTable>) {
    if let Some(root) = fs.root() {
        print!("{}", render_tree(root));
        println!("{}", render_block_usage(root));
    }
    println!("{}", fs.allocator().render());
}

fn main() -> std::result::Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let bat = BlockAllocationTableBuilder::new()
        .with_path(&args.bat)
        .clear_medium(true)
        .build()?;
    info!("formatted block allocation table {}", args.bat.display());
    println!("{}", bat.render());

    println!("===================================");
    println!("= Create a whole filesystem       =");
    println!("===================================");
    let mut fs = InodeTree::new(bat);
    let root = fs.create_dir(None, "/")?;
    fs.create_file(root, "kernel", true, 20000)?;
    let etc = fs.create_dir(Some(root), "etc")?;
    let hosts = fs.create_file(etc, "hosts", false, 200)?;
    let usr = fs.create_dir(Some(root), "usr")?;
    let bin = fs.create_dir(Some(usr), "bin")?;
    let local = fs.create_dir(Some(usr), "local")?;
    let lbin = fs.create_dir(Some(local), "bin")?;
    let nvcc = fs.create_file(lbin, "nvcc", false, 28000)?;
    let gcc = fs.create_file(lbin, "gcc", true, 12623)?;
    let home = fs.create_dir(Some(root), "home")?;
    let course = fs.create_dir(Some(home), "in2140")?;
    let tgz = fs.create_file(course, "oblig.tgz", false, 15000)?;
    let oblig = fs.create_dir(Some(course), "oblig")?;
    fs.create_file(oblig, "CMakeLists.txt", false, 5486)?;
    fs.create_file(oblig, "inode.c", false, 16988)?;
    fs.create_file(oblig, "inode.h", false, 4152)?;
    fs.create_file(bin, "ls", true, 14322)?;
    fs.create_file(bin, "ps", true, 13800)?;
    print_state(&fs);

    println!("===================================");
    println!("= Deleting some things            =");
    println!("===================================");
    report("gcc from / (should fail)", fs.delete_file(root, gcc));
    report(
        "oblig.tgz from /home/in2140 (should succeed)",
        fs.delete_file(course, tgz),
    );
    report(
        "nvcc from /usr/local/bin (should succeed)",
        fs.delete_file(lbin, nvcc),
    );
    report(
        "/ from /etc (should fail)",
        fs.delete_dir(Some(etc), root),
    );
    report("hosts from /etc (should succeed)", fs.delete_file(etc, hosts));
    report("etc from / (should succeed)", fs.delete_dir(Some(root), etc));
    print_state(&fs);

    fs.save_mft(&args.mft)?;
    println!("\n=== Hexdump of {} ===", args.mft.display());
    print!("{}", hexdump(&std::fs::read(&args.mft)?));

    let reloaded = InodeTree::load_mft(&args.mft, BlockAllocationTable::open(&args.bat)?)?;
    if reloaded.root() != fs.root() {
        return Err("reloaded master file table differs from the saved tree".into());
    }
    info!("reloaded {} inodes from {}", reloaded.len(), args.mft.display());

    fs.shutdown();
    println!("++++++++++++++++++++++++++++++++++++++++++++++++");
    println!("+ All inode structures have been");
    println!("+ deleted. The inode info is stored in");
    println!("+ {}", args.mft.display());
    println!("+ The allocated file blocks are stored in");
    println!("+ {}", args.bat.display());
    println!("++++++++++++++++++++++++++++++++++++++++++++++++");
    Ok(())
}
