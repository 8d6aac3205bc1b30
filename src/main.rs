fn main() -> anyhow::Result<()> {
    piotrack_lib::run()
}
