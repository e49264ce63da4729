fn main() -> anyhow::Result<()> {
    phonelunk_lib::run()
}
