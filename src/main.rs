use std::io;

use stacktally::AllocationTable;

fn main() -> io::Result<()> {
  let mut table = AllocationTable::new();

  table.record_alloc(0x1000, 128, &[0x401000, 0x402000]);
  table.record_alloc(0x2000, 64, &[0x401000, 0x402000]);
  table.record_alloc(0x3000, 256, &[0x403000]);
  table.record_free(0x2000);

  println!("=== demo profile ===");
  table.save_profile(&mut io::stdout())?;

  // Pretend a heap walk only reached the first allocation.
  table.mark_as_live(0x1000);
  let leaks = table.non_live_snapshot(None);

  println!("=== unreachable objects ===");
  leaks.report_individual_objects(&mut io::stdout())?;
  println!(
    "{} objects, {} bytes",
    leaks.total().allocs,
    leaks.total().alloc_bytes
  );

  table.release_snapshot(leaks);
  Ok(())
}
