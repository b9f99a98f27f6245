//! courier: relay server binary for an end-to-end-encrypted messenger.

#[tokio::main]
async fn main() {
    courier::server::run().await;
}
