fn main() {
    ccx_client::wrap_command(ccx_shared::CompilerKind::Ar);
}
