use std::sync::Arc;

use crate::device::{BlockFile, MemoryDisk};
use crate::error::{KernelError, Resource};
use crate::fs::{
    BitMap, FileSystem, OpenFile, SynchDisk, FREE_MAP_SECTOR, MAX_FILE_SIZE, NUM_DIRECT,
    NUM_DIR_ENTRIES, NUM_INDIRECT, NUM_SECTORS, SECTOR_SIZE,
};
use crate::vm::{NoffHeader, Segment, VirtualMemoryManager, VmConfig, NOFF_HEADER_SIZE, PAGE_SIZE};

/// 测试时打开日志, 级别由环境变量 LOG 决定
fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 在内存磁盘上格式化一个新的文件系统
pub(crate) fn fresh_fs() -> FileSystem {
    init_log();
    let disk = SynchDisk::new(Arc::new(MemoryDisk::new(NUM_SECTORS)));
    FileSystem::format(disk).unwrap()
}

/// 在当前目录中写入一个只有代码段的可执行文件, 代码紧跟在头部之后
pub(crate) fn write_program(fs: &mut FileSystem, name: &str, code: &[u8]) {
    let hdr = NoffHeader {
        code: Segment {
            virtual_addr: 0,
            in_file_addr: NOFF_HEADER_SIZE as u32,
            size: code.len() as u32,
        },
        ..Default::default()
    };
    let mut bytes = hdr.to_bytes().to_vec();
    bytes.extend_from_slice(code);
    fs.create(name, bytes.len()).unwrap();
    let file = fs.open(name).unwrap();
    assert_eq!(file.write_at(&bytes, 0), bytes.len());
}

fn free_map(fs: &FileSystem) -> BitMap {
    let file = OpenFile::open(FREE_MAP_SECTOR, fs.disk()).unwrap();
    let mut map = BitMap::new(NUM_SECTORS);
    map.fetch_from(&file);
    map
}

fn vm_config(frames: usize) -> VmConfig {
    VmConfig {
        num_phys_pages: frames,
        tlb_size: 2,
        swap_slots: 16,
        user_stack_size: 0,
    }
}

/// 每一页都用不同的字节填充
fn paged_code(pages: usize, base: u8) -> Vec<u8> {
    (0..pages * PAGE_SIZE)
        .map(|i| base.wrapping_add((i / PAGE_SIZE) as u8))
        .collect()
}

#[test]
fn create_remove_restores_free_count() {
    let mut fs = fresh_fs();
    let before = free_map(&fs);
    fs.create("a.txt", 200).unwrap();

    let after = free_map(&fs);
    let file = fs.open("a.txt").unwrap();
    let data = file.header().data_sectors(fs.disk());
    // 200 字节占 2 个扇区, 再加上文件头
    assert_eq!(data.len(), 2);
    assert_eq!(before.num_clear() - after.num_clear(), 3);
    for sector in data.iter().chain(std::iter::once(&file.sector())) {
        assert!(!before.test(*sector));
        assert!(after.test(*sector));
    }
    drop(file);

    fs.remove("a.txt").unwrap();
    assert_eq!(free_map(&fs), before);
    assert!(matches!(fs.open("a.txt"), Err(KernelError::NotFound(_))));
}

#[test]
fn subdirectory_visibility() {
    let mut fs = fresh_fs();
    fs.create_dir("sub", 0).unwrap();
    fs.change("sub").unwrap();
    fs.create("x", 10).unwrap();
    fs.change("..").unwrap();
    assert!(matches!(fs.open("x"), Err(KernelError::NotFound(_))));
    assert_eq!(fs.list().unwrap(), vec!["sub"]);
    fs.change("sub").unwrap();
    assert!(fs.open("x").is_ok());
    assert_eq!(fs.current_path().unwrap(), "root/sub");
}

#[test]
fn duplicate_name_changes_nothing() {
    let mut fs = fresh_fs();
    fs.create("a.txt", 10).unwrap();
    let map = free_map(&fs);
    let names = fs.list().unwrap();
    assert!(matches!(
        fs.create("a.txt", 500),
        Err(KernelError::DuplicateName(_))
    ));
    assert_eq!(free_map(&fs), map);
    assert_eq!(fs.list().unwrap(), names);
}

#[test]
fn full_directory_allocates_nothing() {
    let mut fs = fresh_fs();
    // 第 0 项保留给目录自身
    for i in 1..NUM_DIR_ENTRIES {
        fs.create(&format!("f{}", i), 10).unwrap();
    }
    let map = free_map(&fs);
    assert!(matches!(
        fs.create("one-more", 10),
        Err(KernelError::ExhaustedResource(Resource::DirectorySlots))
    ));
    assert_eq!(free_map(&fs), map);
    assert_eq!(fs.list().unwrap().len(), NUM_DIR_ENTRIES - 1);
}

#[test]
fn oversized_create_allocates_nothing() {
    let mut fs = fresh_fs();
    let map = free_map(&fs);
    assert!(matches!(
        fs.create("big", MAX_FILE_SIZE + 1),
        Err(KernelError::ExhaustedResource(Resource::FileTooLarge))
    ));
    assert_eq!(free_map(&fs), map);
    assert!(fs.list().unwrap().is_empty());
}

#[test]
fn removed_names_stay_in_blob() {
    let mut fs = fresh_fs();
    fs.create("leaky-name", 0).unwrap();
    let names = crate::fs::NameBlob::open(fs.disk()).unwrap();
    let len = names.len();
    drop(names);
    fs.remove("leaky-name").unwrap();
    fs.create("leaky-name", 0).unwrap();
    let names = crate::fs::NameBlob::open(fs.disk()).unwrap();
    assert_eq!(names.len(), len + "leaky-name".len());
}

#[test]
fn remove_open_file_is_busy() {
    let mut fs = fresh_fs();
    fs.create("busy.txt", 10).unwrap();
    let file = fs.open("busy.txt").unwrap();
    let err = fs.remove("busy.txt").unwrap_err();
    assert!(matches!(err, KernelError::Busy { open: 1, .. }));
    drop(file);
    fs.remove("busy.txt").unwrap();
}

#[test]
fn write_grows_file_across_indirect_blocks() {
    let mut fs = fresh_fs();
    fs.create("grow.txt", 0).unwrap();
    let mut file = fs.open("grow.txt").unwrap();
    let initial_free = fs.num_free_sectors();

    let mut expected = Vec::new();
    // 每次写入的长度都不是扇区的整数倍, 以便在扇区中间续写
    for len in [
        3 * SECTOR_SIZE + 17,
        (NUM_DIRECT - 3) * SECTOR_SIZE,
        NUM_INDIRECT * SECTOR_SIZE + 5,
        20 * SECTOR_SIZE,
    ] {
        let chunk: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
        assert_eq!(fs.write(&mut file, &chunk).unwrap(), len);
        expected.extend_from_slice(&chunk);
    }
    assert_eq!(file.length(), expected.len());
    assert_eq!(file.read_all(), expected);

    let sectors = file.header().num_sectors();
    assert!(sectors > NUM_DIRECT + NUM_INDIRECT);
    assert_eq!(file.header().index_sectors().len(), 2);
    assert_eq!(
        initial_free - fs.num_free_sectors(),
        crate::fs::FileHeader::total_sectors(sectors)
    );

    // 重新打开后内容不变
    drop(file);
    let file = fs.open("grow.txt").unwrap();
    let mut buf = vec![0u8; 127];
    let mut read = Vec::new();
    let mut offset = 0;
    loop {
        let n = file.read_at(&mut buf, offset);
        if n == 0 {
            break;
        }
        read.extend_from_slice(&buf[..n]);
        offset += n;
    }
    assert_eq!(read, expected);
}

#[test]
fn two_handles_grow_the_same_header() {
    let mut fs = fresh_fs();
    let before = free_map(&fs);
    fs.create("f.txt", 0).unwrap();
    let mut a = fs.open("f.txt").unwrap();
    let mut b = fs.open("f.txt").unwrap();
    assert_eq!(fs.write(&mut a, &[1u8; 300]).unwrap(), 300);
    // b 打开时文件还是空的, 写入时必须看到 a 扩充后的文件头
    assert_eq!(fs.write(&mut b, &[2u8; 10]).unwrap(), 10);
    assert_eq!(fs.write(&mut b, &[3u8; 400]).unwrap(), 400);
    drop(a);
    drop(b);

    let file = fs.open("f.txt").unwrap();
    assert_eq!(file.length(), 410);
    assert_eq!(file.header().data_sectors(fs.disk()).len(), 4);
    let data = file.read_all();
    assert!(data[..10].iter().all(|&byte| byte == 2));
    assert!(data[10..].iter().all(|&byte| byte == 3));
    drop(file);

    fs.remove("f.txt").unwrap();
    assert_eq!(free_map(&fs), before);
}

#[test]
fn free_map_round_trip() {
    let fs = fresh_fs();
    let file = OpenFile::open(FREE_MAP_SECTOR, fs.disk()).unwrap();
    let mut map = free_map(&fs);
    map.mark(700);
    map.mark(1023);
    map.write_back(&file);
    let mut loaded = BitMap::new(NUM_SECTORS);
    loaded.fetch_from(&file);
    assert_eq!(loaded, map);
}

#[test]
fn remount_restores_current_directory() {
    init_log();
    let device = Arc::new(MemoryDisk::new(NUM_SECTORS));
    {
        let mut fs = FileSystem::format(SynchDisk::new(device.clone())).unwrap();
        fs.create_dir("home", 0).unwrap();
        fs.change("home").unwrap();
        fs.create("note.txt", 0).unwrap();
        let mut file = fs.open("note.txt").unwrap();
        fs.write(&mut file, b"persist me").unwrap();
    }
    let fs = FileSystem::mount(SynchDisk::new(device)).unwrap();
    assert_eq!(fs.current_path().unwrap(), "root/home");
    let file = fs.open("note.txt").unwrap();
    assert_eq!(file.read_all(), b"persist me");
}

#[test]
fn block_file_image() -> std::io::Result<()> {
    init_log();
    let path = std::env::temp_dir().join(format!("nachos-vmfs-{}.img", std::process::id()));
    {
        let device = Arc::new(BlockFile::open(&path, NUM_SECTORS)?);
        let mut fs = FileSystem::format(SynchDisk::new(device)).unwrap();
        fs.create("hello.txt", 0).unwrap();
        let mut file = fs.open("hello.txt").unwrap();
        fs.write(&mut file, b"Hello, world!").unwrap();
    }
    {
        let device = Arc::new(BlockFile::open(&path, NUM_SECTORS)?);
        let fs = FileSystem::mount(SynchDisk::new(device)).unwrap();
        let file = fs.open("hello.txt").unwrap();
        assert_eq!(file.read_all(), b"Hello, world!");
    }
    std::fs::remove_file(&path)
}

#[test]
fn eviction_picks_least_recent_and_restores_from_swap() {
    let mut fs = fresh_fs();
    let frames = 3;
    write_program(&mut fs, "seq.noff", &paged_code(frames + 1, 1));
    let mut vm = VirtualMemoryManager::new(vm_config(frames));
    vm.exec(&fs, 1, "seq.noff").unwrap();

    for vpn in 0..frames {
        assert_eq!(vm.read_mem((vpn * PAGE_SIZE) as u32, 1).unwrap(), vpn as u32 + 1);
    }
    assert_eq!(vm.num_free_frames(), 0);

    // 第 K+1 个页面淘汰最早访问的 vpn 0
    assert_eq!(vm.read_mem((frames * PAGE_SIZE) as u32, 1).unwrap(), frames as u32 + 1);
    let space = vm.space(1).unwrap();
    assert!(!space.pte(0).valid);
    assert_eq!(space.pte(frames).physical_frame, Some(0));
    assert_eq!(vm.swap().find(1, 0).unwrap().page, [1u8; PAGE_SIZE]);

    // 再次访问 vpn 0: 重新缺页, 从交换区恢复出相同的内容
    let faults = vm.stats().page_faults;
    for offset in [0u32, 1, 64, PAGE_SIZE as u32 - 1] {
        assert_eq!(vm.read_mem(offset, 1).unwrap(), 1);
    }
    let stats = vm.stats();
    assert_eq!(stats.page_faults, faults + 1);
    assert_eq!(stats.swap_ins, 1);
    assert_eq!(stats.evictions, 2);
    // 这次被淘汰的是 vpn 1
    assert!(!vm.space(1).unwrap().pte(1).valid);
}

#[test]
fn swapped_page_keeps_its_writes() {
    let mut fs = fresh_fs();
    write_program(&mut fs, "w.noff", &paged_code(3, 0));
    let mut vm = VirtualMemoryManager::new(vm_config(2));
    vm.exec(&fs, 1, "w.noff").unwrap();
    vm.write_mem(8, 4, 0x1122_3344).unwrap();
    vm.read_mem(PAGE_SIZE as u32, 1).unwrap();
    vm.read_mem(2 * PAGE_SIZE as u32, 1).unwrap();
    assert!(!vm.space(1).unwrap().pte(0).valid);
    assert_eq!(vm.read_mem(8, 4).unwrap(), 0x1122_3344);
    assert_eq!(vm.read_mem(8, 2).unwrap(), 0x3344);
}

#[test]
fn dirty_victim_written_back_to_executable() {
    let mut fs = fresh_fs();
    write_program(&mut fs, "dirty.noff", &paged_code(3, 0));
    let mut vm = VirtualMemoryManager::new(vm_config(2));
    vm.exec(&fs, 1, "dirty.noff").unwrap();
    vm.write_mem(0, 4, 0x1122_3344).unwrap();
    vm.read_mem(PAGE_SIZE as u32, 1).unwrap();
    // 第三个页面迫使脏的 vpn 0 被淘汰
    vm.read_mem(2 * PAGE_SIZE as u32, 1).unwrap();
    assert_eq!(vm.stats().dirty_writebacks, 1);

    let file = fs.open("dirty.noff").unwrap();
    let mut word = [0u8; 4];
    file.read_at(&mut word, NOFF_HEADER_SIZE);
    assert_eq!(u32::from_le_bytes(word), 0x1122_3344);
    // 没有被淘汰的页面保持原样
    let mut byte = [0u8; 1];
    file.read_at(&mut byte, NOFF_HEADER_SIZE + PAGE_SIZE);
    assert_eq!(byte[0], 1);
}

#[test]
fn processes_compete_for_frames() {
    let mut fs = fresh_fs();
    write_program(&mut fs, "a.noff", &paged_code(2, 0xa0));
    write_program(&mut fs, "b.noff", &paged_code(2, 0xb0));
    let mut vm = VirtualMemoryManager::new(vm_config(3));

    vm.exec(&fs, 1, "a.noff").unwrap();
    vm.read_mem(0, 1).unwrap();
    vm.read_mem(PAGE_SIZE as u32, 1).unwrap();

    vm.exec(&fs, 2, "b.noff").unwrap();
    assert_eq!(vm.read_mem(0, 1).unwrap(), 0xb0);
    // 没有空闲页框, 淘汰全局最久未使用的线程 1 的 vpn 0
    assert_eq!(vm.read_mem(PAGE_SIZE as u32, 1).unwrap(), 0xb1);
    assert_eq!(vm.frame_owner(0), Some(2));
    assert!(vm.swap().find(1, 0).is_some());
    assert!(!vm.space(1).unwrap().pte(0).valid);
    assert!(!vm.space(1).unwrap().owned_frames().test(0));

    vm.switch_to(1).unwrap();
    assert_eq!(vm.read_mem(0, 1).unwrap(), 0xa0);
    assert_eq!(vm.stats().swap_ins, 1);
    assert_eq!(vm.frame_owner(1), Some(1));

    // 进程运行期间它的可执行文件不能删除
    assert!(matches!(fs.remove("a.noff"), Err(KernelError::Busy { .. })));

    vm.clear_map(1).unwrap();
    assert!(vm.swap().slots().iter().all(|slot| slot.owner != 1));
    assert_eq!(vm.num_free_frames(), 1);
    assert_eq!(vm.frame_owner(1), None);
    assert!(vm.current().is_none());
    fs.remove("a.noff").unwrap();

    // 线程 2 不受影响
    vm.switch_to(2).unwrap();
    assert_eq!(vm.read_mem(PAGE_SIZE as u32 + 3, 1).unwrap(), 0xb1);
}

#[test]
fn clear_map_compacts_swap() {
    let mut fs = fresh_fs();
    write_program(&mut fs, "a.noff", &paged_code(3, 0));
    write_program(&mut fs, "b.noff", &paged_code(3, 0));
    let mut vm = VirtualMemoryManager::new(vm_config(1));

    // 只有一个页框, 每次缺页都会把上一个页面存入交换区
    vm.exec(&fs, 1, "a.noff").unwrap();
    vm.read_mem(0, 1).unwrap();
    vm.exec(&fs, 2, "b.noff").unwrap();
    vm.read_mem(0, 1).unwrap();
    vm.switch_to(1).unwrap();
    vm.read_mem(PAGE_SIZE as u32, 1).unwrap();
    vm.switch_to(2).unwrap();
    vm.read_mem(PAGE_SIZE as u32, 1).unwrap();
    let keys: Vec<_> = vm.swap().slots().iter().map(|s| (s.owner, s.vpn)).collect();
    assert_eq!(keys, vec![(1, 0), (2, 0), (1, 1)]);

    vm.clear_map(1).unwrap();
    let keys: Vec<_> = vm.swap().slots().iter().map(|s| (s.owner, s.vpn)).collect();
    assert_eq!(keys, vec![(2, 0)]);
}

#[test]
fn sequential_scan_beyond_swap_reserve() {
    let mut fs = fresh_fs();
    let config = vm_config(2);
    let pages = config.num_phys_pages + config.swap_slots + 2;
    write_program(&mut fs, "scan.noff", &paged_code(pages, 0));
    let mut vm = VirtualMemoryManager::new(config);
    vm.exec(&fs, 1, "scan.noff").unwrap();

    for vpn in 0..pages {
        assert_eq!(vm.read_mem((vpn * PAGE_SIZE) as u32, 1).unwrap(), vpn as u32);
    }
    assert_eq!(vm.swap().len(), pages - config.num_phys_pages);
    // 最早的页面仍然可以从交换区恢复
    assert_eq!(vm.read_mem(3, 1).unwrap(), 0);
    assert_eq!(vm.stats().swap_ins, 1);
    vm.clear_map(1).unwrap();
    assert!(vm.swap().is_empty());
}

#[test]
fn exec_rejects_overflowing_segments() {
    let mut fs = fresh_fs();
    let hdr = NoffHeader {
        code: Segment {
            virtual_addr: 0,
            in_file_addr: NOFF_HEADER_SIZE as u32,
            size: u32::MAX,
        },
        init_data: Segment {
            virtual_addr: 0,
            in_file_addr: 0,
            size: 16,
        },
        ..Default::default()
    };
    let bytes = hdr.to_bytes();
    fs.create("huge.noff", bytes.len()).unwrap();
    fs.open("huge.noff").unwrap().write_at(&bytes, 0);

    let mut vm = VirtualMemoryManager::new(vm_config(2));
    assert!(matches!(
        vm.exec(&fs, 1, "huge.noff"),
        Err(KernelError::BadExecutable(_))
    ));
    assert!(vm.space(1).is_none());
    // 失败的 exec 不会让可执行文件保持打开
    fs.remove("huge.noff").unwrap();
}
