mod nearby_view;
mod painter;
mod services_view;
mod table;

pub(crate) use self::nearby_view::NearbyView;
pub(crate) use self::painter::Painter;
pub(crate) use self::services_view::ServicesView;
