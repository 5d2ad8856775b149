use crate::game::{Features, RenderFrame};
use crate::network::{Session, SessionPhase};
use macroquad::prelude::*;
use shared::map::ObstacleMap;
use shared::{ImpactKind, PlayerState, BULLET_SIZE, TANK_SIZE};

/// Unpacks a 0xRRGGBB tank colour
pub fn tank_color(rgb: u32) -> Color {
    Color::from_rgba(
        ((rgb >> 16) & 0xff) as u8,
        ((rgb >> 8) & 0xff) as u8,
        (rgb & 0xff) as u8,
        255,
    )
}

/// World position of the screen's top-left corner when centred on (x, y)
pub fn camera_origin(x: f32, y: f32, width: f32, height: f32) -> (f32, f32) {
    (x - width / 2.0, y - height / 2.0)
}

#[derive(Debug, Clone)]
pub struct HudInfo {
    pub features: Features,
    pub ping_ms: Option<u64>,
    pub fake_ping_ms: u64,
}

pub struct Renderer {
    width: f32,
    height: f32,
    camera: (f32, f32),
}

impl Renderer {
    pub fn new(width: usize, height: usize) -> Self {
        Renderer {
            width: width as f32,
            height: height as f32,
            camera: (0.0, 0.0),
        }
    }

    pub fn camera(&self) -> (f32, f32) {
        self.camera
    }

    /// Centres the view on the local tank, or on the arena while spectating
    pub fn follow(&mut self, target: Option<(f32, f32)>, map: Option<&ObstacleMap>) {
        self.width = screen_width();
        self.height = screen_height();
        let centre = target
            .or_else(|| map.map(|m| m.center()))
            .unwrap_or((0.0, 0.0));
        self.camera = camera_origin(centre.0, centre.1, self.width, self.height);
    }

    pub fn render(
        &self,
        frame: &RenderFrame,
        map: Option<&ObstacleMap>,
        session: &Session,
        hud: &HudInfo,
    ) {
        clear_background(Color::from_rgba(26, 26, 26, 255));

        if let Some(map) = map {
            self.draw_map(map);
        }
        for (x, y, kind) in session.impacts() {
            self.draw_impact(*x, *y, *kind);
        }
        for bullet in &frame.bullets {
            let (sx, sy) = self.to_screen(bullet.x, bullet.y);
            draw_circle(sx, sy, BULLET_SIZE / 2.0, YELLOW);
        }
        for player in &frame.players {
            self.draw_tank(player, Some(player.id) == session.client_id());
        }

        self.draw_hud(frame, session, hud);
    }

    fn to_screen(&self, x: f32, y: f32) -> (f32, f32) {
        (x - self.camera.0, y - self.camera.1)
    }

    fn visible(&self, x: f32, y: f32, w: f32, h: f32) -> bool {
        let (sx, sy) = self.to_screen(x, y);
        sx + w >= 0.0 && sy + h >= 0.0 && sx <= self.width && sy <= self.height
    }

    fn draw_map(&self, map: &ObstacleMap) {
        for o in &map.obstacles {
            if !self.visible(o.x, o.y, o.w, o.h) {
                continue;
            }
            let (sx, sy) = self.to_screen(o.x, o.y);
            draw_rectangle(sx, sy, o.w, o.h, Color::from_rgba(68, 68, 68, 255));
            draw_rectangle_lines(sx, sy, o.w, o.h, 1.0, Color::from_rgba(100, 100, 100, 255));
        }
    }

    fn draw_tank(&self, player: &PlayerState, is_local: bool) {
        let reach = TANK_SIZE * 2.0;
        if !self.visible(player.x - TANK_SIZE, player.y - TANK_SIZE, reach, reach) {
            return;
        }
        let (sx, sy) = self.to_screen(player.x, player.y);
        let half = TANK_SIZE / 2.0;

        draw_rectangle(sx - half, sy - half, TANK_SIZE, TANK_SIZE, tank_color(player.color));
        draw_rectangle_lines(
            sx - half,
            sy - half,
            TANK_SIZE,
            TANK_SIZE,
            2.0,
            if is_local { GREEN } else { WHITE },
        );

        let (sin, cos) = player.angle.sin_cos();
        draw_line(sx, sy, sx + cos * (half + 8.0), sy + sin * (half + 8.0), 4.0, LIGHTGRAY);

        if player.invincible {
            draw_circle_lines(sx, sy, TANK_SIZE, 2.0, SKYBLUE);
        }

        let label = format!("{} ({})", player.name, player.pot);
        draw_text(&label, sx - half, sy - half - 6.0, 14.0, WHITE);
    }

    fn draw_impact(&self, x: f32, y: f32, kind: ImpactKind) {
        let (sx, sy) = self.to_screen(x, y);
        let color = match kind {
            ImpactKind::Border => GRAY,
            ImpactKind::Wall => ORANGE,
            ImpactKind::Shield => SKYBLUE,
        };
        draw_circle_lines(sx, sy, 8.0, 1.0, color);
    }

    fn draw_hud(&self, frame: &RenderFrame, session: &Session, hud: &HudInfo) {
        let y_start = 10.0;
        let indicator_size = 12.0;
        let spacing = 25.0;

        let features = [
            ("P", hud.features.prediction),
            ("R", hud.features.reconciliation),
            ("I", hud.features.interpolation),
        ];

        for (i, (label, enabled)) in features.iter().enumerate() {
            let x = 10.0 + (i as f32) * spacing;
            let color = if *enabled { GREEN } else { RED };

            draw_rectangle(x, y_start, indicator_size, indicator_size, color);
            draw_rectangle_lines(x, y_start, indicator_size, indicator_size, 1.0, WHITE);

            draw_text(label, x + 3.0, y_start + indicator_size + 12.0, 12.0, WHITE);
        }

        let total_ping = hud.ping_ms.unwrap_or(0) + hud.fake_ping_ms;
        let ping_color = if total_ping < 50 {
            GREEN
        } else if total_ping < 100 {
            YELLOW
        } else {
            RED
        };
        draw_text(&format!("{}ms", total_ping), 10.0, y_start + 45.0, 16.0, ping_color);

        let wallet = session
            .wallet_balance()
            .map_or_else(|| "-".to_string(), |w| w.to_string());
        draw_text(
            &format!("Wallet {}  Pot {}", wallet, session.pot()),
            10.0,
            y_start + 65.0,
            18.0,
            WHITE,
        );
        draw_text(
            &format!("{}  |  {} tanks", session.phase(), frame.players.len()),
            10.0,
            y_start + 85.0,
            16.0,
            LIGHTGRAY,
        );
        if let Some(reason) = session.last_failure() {
            draw_text(reason, 10.0, y_start + 105.0, 16.0, RED);
        }

        let hint = match session.phase() {
            SessionPhase::InGame => "WASD move  Mouse aim  Click shoot  C cash out  Q quit",
            _ => "J join  1/2/3 toggle netcode features",
        };
        draw_text(hint, 10.0, self.height - 12.0, 16.0, GRAY);

        for (i, entry) in session.scoreboard().iter().take(5).enumerate() {
            let text = format!("{}. {}  {}/{}", i + 1, entry.name, entry.kills, entry.deaths);
            draw_text(&text, self.width - 200.0, y_start + 14.0 + i as f32 * 18.0, 16.0, WHITE);
        }
    }
}
