fn main() {
    remotecam_lib::run()
}
