fn main() -> anyhow::Result<()> {
    stayactive_lib::run()
}
