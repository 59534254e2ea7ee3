pub fn main() {
    println!("{}", sluice_api::openapi_service().spec());
}
