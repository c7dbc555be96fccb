use someip_router_sdk::{Application, Event};

use codec::message::ReturnCode;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Connect to the routing host named "routingmanagerd" and offer a
    // tiny echo service.
    let mut app = Application::connect("hello-service", "routingmanagerd").await?;
    println!("Registered as client {:#06x}", app.client());

    app.offer_service(0x1234, 0x0001, 1, 0)?;

    while let Some(event) = app.next_event().await {
        match event {
            Event::Offered { service, instance, accepted } => {
                println!("Offer of {service:#06x}.{instance:#06x} accepted={accepted}");
            }
            Event::Message { instance, message } => {
                println!(
                    "Call from client {:#06x}: method={:#06x}, payload={:?}",
                    message.header.client, message.header.method, message.payload
                );

                // Echo the payload back to the caller.
                let payload = message.payload.clone();
                app.respond(instance, &message.header, ReturnCode::Ok, &payload)?;
            }
            other => {
                println!("Event: {other:?}");
            }
        }
    }

    Ok(())
}
